//! Live, client-side mirrors of DBus object trees.
//!
//! An [`ObjectNode`] mirrors the properties of one remote object, following properties that hold
//! object paths into child nodes, and keeps everything in sync with the remote's
//! `PropertiesChanged` signals. What gets mirrored is described by a [`FieldDefinition`].

mod error;
pub use error::*;

mod node;
pub use node::*;

mod ordered_map;
pub use ordered_map::*;

mod schema;
pub use schema::*;

mod transport;
pub use transport::*;

mod value;
pub use value::*;

pub mod zbus_transport;
pub use zbus_transport::ZbusTransport;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use zbus;
pub use zbus::zvariant;
