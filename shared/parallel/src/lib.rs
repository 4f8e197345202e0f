mod context;
mod local;
mod process_group;
mod sanity_checks;

pub use context::{ParallelContext, ParallelismConfig, ParallelismError};
pub use local::{LocalCluster, LocalProcessGroup};
pub use process_group::{
    AllReduce, CollectiveError, Collectives, ProcessGroup, ReduceType, SingleProcessGroup,
};
pub use sanity_checks::{
    main_rank_first, verify_synced_across_pg, verify_values_synced_across_pg, SyncCheckError,
    SynchronizationError,
};
