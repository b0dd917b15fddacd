#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)]
#![allow(clippy::uninlined_format_args)]

pub mod channel;
mod codecs;
pub mod ctx;
mod dispatch;
pub mod engine;
pub mod middleware;
pub mod msgs;
pub mod peer;
mod stop;
pub mod stream;
mod table;

pub use channel::{
    BoxedFrameSink, BoxedFrameStream, Channel, ChannelError, ChannelId, CloseHandle,
};
pub use ctx::RequestContext;
pub use engine::{ChannelConfig, Engine, EngineBuilder, EngineBuilderError};
pub use middleware::{Middleware, Next};
pub use peer::Peer;
pub use stream::RemoteStream;

// The pieces of the base crate that application code touches all the
// time, re-exported for convenience.
pub use crosstalk_base::{
    CallError, Catalog, CatalogBuilder, CatalogError, EndpointKind, HandlerError, Route, Side,
    ValidationError, Validator,
};
