//! Shared protocol constants for the cloudsync framed transport

// Default server port, used when an address omits one
pub const DEFAULT_PORT: u16 = 2115;

// Maximum FileTransfer body (256MB) - prevents memory exhaustion from a bogus length
pub const MAX_FILE_SIZE: usize = 256 * 1024 * 1024;

// Maximum entries in FilesList / DeletedList / UsersList
pub const MAX_LIST_ENTRIES: usize = 65_536;

// Strings carry a u16 length prefix
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

// Message tags (keep numeric stable, both ends are built from this table)
pub mod tag {
    pub const GREETING: u8 = 1;
    pub const GOODBYE: u8 = 2;
    pub const FILE_TRANSFER: u8 = 3;
    pub const FILES_LIST: u8 = 4;
    pub const DELETED_LIST: u8 = 5;
    pub const USERS_LIST: u8 = 6;
    pub const RELAY_REQUEST: u8 = 7;
}

// Centralized timing constants shared by client and server
pub mod timeouts {
    // Delay between two polls of a watched folder (ms)
    pub const POLL_INTERVAL_MS: u64 = 250;

    // Retry delay while waiting for a file to stop changing (ms)
    pub const STABILITY_RETRY_MS: u64 = 100;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // A send fails once the peer accepts no bytes for this long (ms)
    pub const WRITE_STALL_MS: u64 = 30_000;
}

// Frames are written in pieces of this size so a stall is detected per piece
pub const WRITE_CHUNK: usize = 64 * 1024;
