//! Client tier of the pipeline.
//!
//! A [`KioskSession`] sits next to the live conversation: the
//! [`TurnTracker`] decides which turns need analysis, a [`JobGateway`]
//! dispatches and polls, and [`ResultDelivery`] injects finished results back
//! into the conversation once each.

pub mod delivery;
pub mod gateway;
pub mod outstanding;
pub mod session;
pub mod tracker;

pub use delivery::{ConversationChannel, DeliveryReport, Insight, OutboundMessage, ResultDelivery};
pub use gateway::{HttpGateway, JobGateway, LocalGateway};
pub use outstanding::OutstandingJobs;
pub use session::KioskSession;
pub use tracker::{ConversationTurn, TurnTracker, ANALYSIS_MARKER};
