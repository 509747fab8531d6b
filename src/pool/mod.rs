pub mod allocator;
pub mod config;
pub mod error;
pub mod page;
pub mod quota;
pub mod special;
pub mod types;

pub(crate) mod big_pages;
pub(crate) mod cpu;
pub(crate) mod deferred;
pub(crate) mod descriptor;
pub(crate) mod header;
pub(crate) mod integration;
pub(crate) mod lookaside;
pub(crate) mod slist;
pub(crate) mod stats;
pub(crate) mod tracker;
