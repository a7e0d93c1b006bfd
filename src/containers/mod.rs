pub mod id_table;
pub mod keyed_priority_queue;

pub use id_table::IdTable;
pub use keyed_priority_queue::KeyedPriorityQueue;
