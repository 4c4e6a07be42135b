//! Contains the user record which is served by the system.
use serde_json::{json, Value};

/// Represents a user as stored in the [Store](crate::store::Store).
///
/// Records are immutable once created. Two users are equal if all their fields are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Contains the unique id (always >= 1).
    pub id: u64,
    /// Contains the display name.
    pub name: String,
    /// Contains the email address.
    pub email: String,
}

impl User {
    /// Creates a new user record.
    pub fn new(id: u64, name: impl Into<String>, email: impl Into<String>) -> Self {
        User {
            id,
            name: name.into(),
            email: email.into(),
        }
    }

    /// Renders the user as JSON object.
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "email": self.email,
        })
    }
}

/// Contains the data required to create a new user.
///
/// The id is assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    /// Contains the display name.
    pub name: String,
    /// Contains the email address.
    pub email: String,
}

impl NewUser {
    /// Extracts and validates a new user from the given JSON object.
    ///
    /// Both, **name** and **email** have to be present as non-empty strings.
    ///
    /// # Example
    /// ```
    /// # use serde_json::json;
    /// # use userhub::user::NewUser;
    /// let user = NewUser::from_json(&json!({"name": "Test User", "email": "test@example.com"}));
    /// assert_eq!(user.unwrap().name, "Test User");
    ///
    /// assert!(NewUser::from_json(&json!({"name": "Test User"})).is_err());
    /// assert!(NewUser::from_json(&json!({"name": " ", "email": "x@y.z"})).is_err());
    /// ```
    pub fn from_json(value: &Value) -> Result<Self, String> {
        let name = non_empty_string(value, "name")?;
        let email = non_empty_string(value, "email")?;

        Ok(NewUser { name, email })
    }
}

fn non_empty_string(value: &Value, field: &str) -> Result<String, String> {
    match value.get(field).and_then(Value::as_str).map(str::trim) {
        Some(text) if !text.is_empty() => Ok(text.to_owned()),
        Some(_) => Err(format!("The field '{}' must not be empty.", field)),
        None => Err(format!("The field '{}' is required.", field)),
    }
}
