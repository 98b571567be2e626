//! Placeholder substitution for message templates.

use shared::protocol::{Profile, TeamMember};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipient {
    pub name: Option<String>,
    pub email: Option<String>,
    pub kind: Option<String>,
}

impl From<&TeamMember> for Recipient {
    fn from(member: &TeamMember) -> Self {
        Self {
            name: Some(member.name.clone()),
            email: member.email.clone(),
            kind: member.role.clone(),
        }
    }
}

impl From<&Profile> for Recipient {
    fn from(profile: &Profile) -> Self {
        Self {
            name: Some(profile.display_name()),
            email: profile.email.clone(),
            kind: None,
        }
    }
}

impl Recipient {
    fn resolve(&self, token: &str) -> Option<String> {
        let value = if token.eq_ignore_ascii_case("name") {
            self.name.clone()
        } else if token.eq_ignore_ascii_case("first_name") {
            self.name
                .as_deref()
                .and_then(|name| name.split_whitespace().next())
                .map(str::to_string)
        } else if token.eq_ignore_ascii_case("email") {
            self.email.clone()
        } else if token.eq_ignore_ascii_case("type") {
            self.kind.clone()
        } else {
            return None;
        };
        Some(value.unwrap_or_default())
    }
}

/// Replaces `{{name}}`, `{{first_name}}`, `{{email}}` and `{{type}}`
/// (any letter case) with the recipient's fields. Missing fields become empty;
/// unknown placeholders are left as written.
pub fn personalize(template: &str, recipient: &Recipient) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        if let Some(end) = after.find("}}") {
            if let Some(value) = recipient.resolve(&after[..end]) {
                out.push_str(&value);
                rest = &after[end + 2..];
                continue;
            }
        }
        out.push('{');
        rest = &rest[start + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
#[path = "tests/personalize_tests.rs"]
mod tests;
