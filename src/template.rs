use std::collections::HashMap;

use crate::models::Contact;

/// Substitute `{{key}}` placeholders. Unknown keys render as empty.
pub fn render(template: &str, values: &HashMap<&str, String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some(value) = values.get(key) {
                    output.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}

pub fn contact_values(contact: &Contact) -> HashMap<&'static str, String> {
    let mut values = HashMap::new();
    values.insert("email", contact.email.clone());
    values.insert(
        "firstName",
        contact.first_name.clone().unwrap_or_default(),
    );
    values.insert("company", contact.company.clone().unwrap_or_default());
    values
}
