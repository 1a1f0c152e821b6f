use std::fs::File;
use std::io;

/// Durability policy applied after each store write.
///
/// `Critical` fsyncs every write (metadata and ledger default), `Bulk`
/// fsyncs on close of batched writes, `None` leaves flushing to the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    #[default]
    Critical,
    Bulk,
    None,
}

impl FsyncPolicy {
    /// Sync `file` according to the policy; `final_write` marks the last
    /// write of a batch.
    pub fn sync(&self, file: &File, final_write: bool) -> io::Result<()> {
        match self {
            FsyncPolicy::Critical => file.sync_all(),
            FsyncPolicy::Bulk if final_write => file.sync_all(),
            _ => Ok(()),
        }
    }
}
