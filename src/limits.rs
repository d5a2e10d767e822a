/// Max resources in a week layout (slot space = days × resources).
pub const MAX_RESOURCES: usize = 64;

/// Max length of a resource's internal name.
pub const MAX_NAME_LEN: usize = 64;

/// Max length of a resource's display label.
pub const MAX_LABEL_LEN: usize = 128;

/// Max length of an actor identity.
pub const MAX_ACTOR_LEN: usize = 256;

/// Max entries in the static name directory.
pub const MAX_DIRECTORY_ENTRIES: usize = 10_000;
