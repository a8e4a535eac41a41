//! json encoders shared by the state document, signatures and the wire
//!
//! the canonical encoder is authoritative for everything written to disk or
//! sent over the network; the pretty encoder is only for people.

mod canonical;
mod patch;

pub use canonical::{
    expect_object, i64_field, parse, parse_object, to_canonical_string, to_canonical_vec,
    to_pretty_vec, write_canonical,
};
pub use patch::{apply_merge_patch, create_merge_patch, merge_patch};
