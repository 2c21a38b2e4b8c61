//! Transactional containers composed from [`vellum_stm::TCell`].
//!
//! Both containers keep their structure in one cell and their elements in
//! per-entry cells, so element-level operations conflict only with other
//! writers of the same entry. All operations run inside the caller's
//! transaction and are atomic with whatever else the transaction does.

mod dict;
mod list;

pub use dict::TDict;
pub use list::TList;
