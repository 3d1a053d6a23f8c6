use thiserror::Error;

/// Error name the bus uses when an object doesn't implement the requested interface.
pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Dbus connection error")]
    DbusError(#[from] zbus::Error),
    #[error("Dbus value error")]
    Variant(#[from] zbus::zvariant::Error),
    #[error("{name}: {message}")]
    Method { name: String, message: String },
    #[error("No such interface found")]
    InterfaceNotFound { interface: String, path: String },
    #[error("Interface {interface} of {path} was never resolved")]
    Unresolved { interface: String, path: String },
    #[error("Property {0} is not declared as a scalar in the subtree")]
    UndeclaredField(String),
    #[error("Unexpected reply to {method}: {reason}")]
    UnexpectedReply { method: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error means the object at `path` simply doesn't implement `interface`.
    ///
    /// Services phrase this differently, so aside from the well-known error name a few message
    /// variants are recognised too.
    pub fn is_interface_absent(&self, interface: &str, path: &str) -> bool {
        match self {
            Error::InterfaceNotFound { .. } => true,
            Error::Method { name, message } => {
                name == UNKNOWN_INTERFACE
                    || *message == format!("No such interface “{}”", interface)
                    || *message == format!("No such interface “{}” on object at path {}", interface, path)
                    || message == "No such interface found"
            }
            _ => false,
        }
    }

    /// Message of a remote error reply, if this is one.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Error::Method { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl From<zbus::fdo::Error> for Error {
    fn from(err: zbus::fdo::Error) -> Self {
        match err {
            zbus::fdo::Error::UnknownInterface(message) => Error::Method { name: UNKNOWN_INTERFACE.to_owned(), message },
            zbus::fdo::Error::ZBus(err) => Error::from_zbus(err),
            other => Error::Method { name: "org.freedesktop.DBus.Error.Failed".to_owned(), message: other.to_string() },
        }
    }
}

impl Error {
    /// Convert a zbus error, flattening remote error replies into [`Error::Method`].
    pub fn from_zbus(err: zbus::Error) -> Self {
        match err {
            zbus::Error::MethodError(name, message, _) => {
                Error::Method { name: name.to_string(), message: message.unwrap_or_default() }
            }
            zbus::Error::FDO(err) => Error::from(*err),
            other => Error::DbusError(other),
        }
    }
}
