use super::store::Resource;
use serde::{Deserialize, Serialize};
use switchyard::Status;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    /// Unit price in the smallest currency unit.
    pub price_cents: u64,
}

impl Resource for Product {
    const SERVICE: &'static str = "switchyard.Products";
    const KIND: &'static str = "product";

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), Status> {
        if self.id.trim().is_empty() {
            return Err(Status::invalid_argument("product id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(Status::invalid_argument("product name must not be empty"));
        }
        Ok(())
    }
}
