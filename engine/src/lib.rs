//! Real-time border-color streaming for ambient lighting.
//!
//! A client asks for a video to be processed; a [`session::ProcessingSession`]
//! pulls frames from a [`source::FrameSource`], runs every Nth frame through
//! the [`extractor`], and pushes the result to that client through an
//! [`emitter::Emitter`]. The [`registry::SessionRegistry`] keeps at most one
//! live session per connection and the [`control::ControlPlane`] turns client
//! requests into registry calls.

pub mod control;
pub mod emitter;
pub mod error;
pub mod extractor;
pub mod registry;
pub mod session;
pub mod source;
pub mod store;

pub use ambilight_common::frame::{Frame, Rgb, ZoneColorSet};
pub use ambilight_common::protocol::{ClientEvent, ServerEvent};
pub use ambilight_common::settings::{Settings, SettingsPatch};
