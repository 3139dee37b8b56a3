//! # uasub - Subscription engine for OPC UA style telemetry
//!
//! uasub lets a client subscribe to variables in a server's address space and receive
//! ordered, timestamped change notifications at a negotiated rate. A server samples
//! each monitored variable on its own interval, queues detected changes per item and
//! delivers them in batches on each subscription's publishing cycle, with keep-alives
//! while nothing changes and lifetime expiry when the client stops asking.
//!
//! ## Core Concepts
//!
//! - **Variable**: A named node whose value is produced by a getter and optionally
//!   accepted by a setter
//! - **Session**: A client's authenticated context; it owns its subscriptions
//! - **Subscription**: A publishing cycle with keep-alive and lifetime counters
//! - **Monitored item**: A sampled variable with a bounded notification queue
//! - **Publish request**: An outstanding client request answered with the next
//!   notification message
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use uasub::subscription::{MonitoringParameters, NotificationBody, SubscriptionParameters};
//! use uasub::time::ManualClock;
//! use uasub::{DataType, InMemoryAddressSpace, NodeId, Server, ServerConfig, UserIdentity, Variable, Variant};
//!
//! let space = Arc::new(InMemoryAddressSpace::new());
//! let device = space
//!     .add_object(&uasub::node_id::well_known::OBJECTS_FOLDER, "MyDevice", None)
//!     .unwrap();
//! let temp = NodeId::string(1, "temp");
//! space
//!     .add_variable(
//!         &device,
//!         Variable::builder(temp.clone(), "Temp", DataType::Double)
//!             .value(Variant::Double(20.5))
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap();
//!
//! let clock = Arc::new(ManualClock::new());
//! let server = Server::new(ServerConfig::default(), space, clock.clone()).unwrap();
//! let session = server.create_session(&UserIdentity::Anonymous).unwrap();
//!
//! let sub = session
//!     .create_subscription(&SubscriptionParameters::default())
//!     .unwrap();
//! session
//!     .create_monitored_item(sub.id, &temp, &MonitoringParameters::new(7))
//!     .unwrap();
//! let request = session.publish(sub.id).unwrap();
//!
//! server.advance(&clock, Duration::from_secs(1)).unwrap();
//! let response = request.try_take().unwrap();
//! match response.message.body {
//!     NotificationBody::DataChange(items) => assert_eq!(items[0].client_handle, 7),
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod node_id;
pub mod status;
pub mod time;
pub mod value;

// Configuration and address space
pub mod address_space;
pub mod config;

// Engine
pub mod client;
pub mod server;
pub mod subscription;

// Re-export primary types at crate root for convenience
pub use address_space::{AddressSpace, ChildReference, InMemoryAddressSpace, NodeClass, Variable, VariableBuilder};
pub use client::{ClientSession, ClientSubscription, ItemChange, SessionChannel, SubscriptionEvent};
pub use config::{BuildInfo, ServerConfig, SubscriptionLimits, UserCredential};
pub use error::{ConfigurationError, ServiceError, TransportError, UaError, UaResult};
pub use node_id::NodeId;
pub use server::{Server, Session, SessionId, TimerThread, UserIdentity};
pub use status::StatusCode;
pub use time::{Clock, ManualClock, SystemClock};
pub use value::{DataType, DataValue, TimestampsToReturn, Variant};
