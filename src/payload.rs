use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};

/// A value that can travel as a message body.
///
/// The clients never look inside a payload: they publish whatever
/// [`to_message`](Payload::to_message) produces and hand raw deliveries to
/// consumers, who call [`from_message`](Payload::from_message) themselves.
/// Both directions have to be provided by the implementor.
pub trait Payload: Sized {
    /// Produce the exact string placed on the wire.
    fn to_message(&self) -> Result<String>;

    /// Rebuild a value from a string produced by [`to_message`](Payload::to_message).
    fn from_message(message: &str) -> Result<Self>;
}

/// A payload serialized as JSON through serde.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use terrier::{Json, Payload};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct Person {
///     firstname: String,
///     lastname: String,
/// }
///
/// let john = Json(Person { firstname: "John".into(), lastname: "Doe".into() });
/// let message = john.to_message().unwrap();
/// assert_eq!(message, r#"{"firstname":"John","lastname":"Doe"}"#);
/// assert_eq!(Json::<Person>::from_message(&message).unwrap(), john);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: Serialize + DeserializeOwned> Payload for Json<T> {
    fn to_message(&self) -> Result<String> {
        serde_json::to_string(&self.0).map_err(|e| Error::InvalidPayload(e.to_string()))
    }

    fn from_message(message: &str) -> Result<Self> {
        serde_json::from_str(message)
            .map(Json)
            .map_err(|e| Error::InvalidPayload(e.to_string()))
    }
}

impl Payload for String {
    fn to_message(&self) -> Result<String> {
        Ok(self.clone())
    }

    fn from_message(message: &str) -> Result<Self> {
        Ok(message.to_string())
    }
}
