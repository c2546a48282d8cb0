//! cti-migrate: resumable migration of a threat-intelligence knowledge base
//!
//! Every object of the source platform is read through its GraphQL API,
//! rewritten into a STIX bundle and pushed to the destination platform's
//! ingestion queue over AMQP. The run is split into five fixed stages:
//!
//! 1. **Domain objects** -- everything except reports and notes; place
//!    identities (region, country, city) become locations
//! 2. **Observables** -- re-expressed as simple observables keyed by STIX path
//! 3. **Core relationships** -- relationships between two entities
//! 4. **Relationships to relationships** -- relationships with a relationship endpoint
//! 5. **Containers** -- reports and notes, last so their contents already exist
//!
//! # Resuming
//!
//! A small JSON checkpoint (`{"step", "after", "number"}`) is rewritten
//! atomically after every page. A restarted run continues from the stored
//! stage and cursor; completed stages are never revisited. Delivery is
//! at-least-once: a page interrupted half-way is published again in full.
//!
//! # Key Modules
//!
//! - [`migrate`] -- stage sequencer and page loop
//! - [`stage`] -- the stage order (transition table)
//! - [`fetch`] -- cursor pagination with order checking
//! - [`transform`] -- per-stage rewrite rules and the observable key table
//! - [`publish`] -- publisher with reconnect-and-retry, AMQP broker
//! - [`source`] -- source platform client
//! - [`checkpoint`] -- migration state persistence
//! - [`config`] -- options, validation and constants
//!
//! # Example Usage
//!
//! ```bash
//! cti-migrate -v run \
//!     --source-url http://opencti-v3:4000/graphql --source-token $TOKEN \
//!     --connector-id $CONNECTOR --broker-host rabbitmq \
//!     --broker-user guest --broker-password guest
//!
//! # Inspect where an interrupted run will resume
//! cti-migrate status
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fetch;
pub mod migrate;
pub mod models;
pub mod publish;
pub mod source;
pub mod stage;
pub mod stats;
pub mod transform;

pub use error::{MigrateError, Result};
