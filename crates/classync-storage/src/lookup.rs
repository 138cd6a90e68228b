/// Keys at or below this count are looked up with one OR-composed filter.
pub const SMALL_LOOKUP_LIMIT: usize = 10;

/// Upper bound of keys joined against the table in one unnest query.
pub const LOOKUP_CHUNK_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupPlan {
    Empty,
    OrFilter,
    UnnestJoin { chunks: usize },
}

impl LookupPlan {
    pub fn for_key_count(count: usize) -> Self {
        match count {
            0 => Self::Empty,
            n if n <= SMALL_LOOKUP_LIMIT => Self::OrFilter,
            n => Self::UnnestJoin {
                chunks: n.div_ceil(LOOKUP_CHUNK_SIZE),
            },
        }
    }

    pub fn query_count(self) -> usize {
        match self {
            Self::Empty => 0,
            Self::OrFilter => 1,
            Self::UnnestJoin { chunks } => chunks,
        }
    }
}
