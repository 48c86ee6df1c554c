//! Multi-agent grouping and routing: comms, channels, hordes,
//! overseer hierarchy, capability discovery, and disposal archives.
//!
//! A "legion" is a project viewed as a fleet: its minions, their
//! hierarchical hordes, and the channels they talk on. Project ids
//! double as legion ids; legion-scoped data lives under
//! `data/legions/<project_id>/`.

pub mod archive;
pub mod capabilities;
pub mod channels;
pub mod comms;
pub mod overseer;
pub mod prompts;
pub mod router;

pub use archive::{ArchiveManager, DisposalMetadata};
pub use capabilities::CapabilityRegistry;
pub use channels::{Channel, ChannelManager};
pub use comms::{Comm, CommType, InterruptPriority};
pub use overseer::{Horde, HordeStore, OverseerController};
pub use router::CommRouter;
