pub mod bulkget;
pub mod load;
