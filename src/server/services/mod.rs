pub mod edge_services;
pub mod megaup_services;
pub mod source_cache_services;

pub use megaup_services::DynMegaUpService;
pub use source_cache_services::DynSourceCacheService;
