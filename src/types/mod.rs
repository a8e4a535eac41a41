mod state;

pub use state::{
    is_json_key, is_reserved, Staged, StagedEntry, State, StateValue, Status, DEFAULT_SPEC,
    RESERVED_PREFIXES, SPEC_KEY,
};
