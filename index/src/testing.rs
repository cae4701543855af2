use std::sync::Once;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::collation::CollationRule;
use crate::config::IndexConfig;
use crate::index::Index;
use crate::storage::MemoryHost;

static TRACING: Once = Once::new();

/// Install a test-writer subscriber filtered by `RUST_LOG`, once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "ntfs_index=warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

/// Block size small enough that a leaf holds three u32 entries.
pub const SMALL_BLOCK_SIZE: u32 = 152;

/// A new in-memory u32-keyed index with tiny blocks and a root record of
/// `capacity` bytes.
pub fn small_index(capacity: usize) -> Index<MemoryHost> {
    init_tracing();
    Index::create(
        MemoryHost::new(capacity),
        "$SII",
        0,
        CollationRule::UnsignedLong,
        &IndexConfig::with_block_size(SMALL_BLOCK_SIZE),
        None,
    )
    .expect("create index")
}

/// All keys of an index decoded as u32, in traversal order.
pub fn u32_keys(index: &mut Index<MemoryHost>) -> Vec<u32> {
    index
        .entries()
        .map(|entry| {
            let (key, _) = entry.expect("entry");
            u32::from_le_bytes(key[..4].try_into().expect("u32 key"))
        })
        .collect()
}
