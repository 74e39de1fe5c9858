//! Canonicalization of request URLs into deterministic build identities,
//! and the compact args-prefix codec used inside CDN URLs.

pub mod args;
pub mod identity;
pub mod parse;

pub use args::{decode_args_prefix, encode_args_prefix};
pub use identity::BuildIdentity;
pub use parse::{
    parse_module_path, parse_query, parse_target_segment, ModulePath, QueryOptions, TargetSegment,
};
