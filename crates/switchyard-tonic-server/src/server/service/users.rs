use super::store::Resource;
use serde::{Deserialize, Serialize};
use switchyard::Status;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
}

impl Resource for User {
    const SERVICE: &'static str = "switchyard.Users";
    const KIND: &'static str = "user";

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), Status> {
        if self.id.trim().is_empty() {
            return Err(Status::invalid_argument("user id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(Status::invalid_argument("user name must not be empty"));
        }
        // Only the shape is checked; deliverability is not our concern.
        match self.email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
            _ => Err(Status::invalid_argument(format!(
                "user email `{}` is not an address",
                self.email
            ))),
        }
    }
}
