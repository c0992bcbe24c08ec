#[derive(Debug)]
pub enum Error {
    Io(String),
    PoolExhausted,
    InvalidPage(i32),
    TreeInvariant(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(context) => write!(f, "I/O error: {context}."),
            Error::PoolExhausted => write!(f, "buffer pool exhausted: no free or evictable frame"),
            Error::InvalidPage(page_id) => write!(f, "invalid page id: {page_id}"),
            Error::TreeInvariant(context) => write!(f, "tree invariant violated: {context}"),
        }
    }
}
