/// A direct exchange, used only when publishing does not go through the
/// default exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeRef {
    pub name: String,
    pub auto_delete: bool,
}

impl ExchangeRef {
    pub fn new(name: &str, auto_delete: bool) -> Self {
        Self {
            name: name.to_string(),
            auto_delete,
        }
    }

    /// The nameless exchange routing by queue name needs no resolution.
    pub fn is_default(name: &str) -> bool {
        name.is_empty()
    }
}
