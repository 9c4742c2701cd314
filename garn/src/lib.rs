mod atomic_int;
mod entry;
mod hashtable;
mod interpreter;
mod program;
mod queue;
mod registry;
mod replicate;
mod serialize;
mod task;
mod thread;
mod value;
mod vector;

pub use atomic_int::*;
pub use entry::*;
pub use hashtable::*;
pub use interpreter::*;
pub use program::*;
pub use queue::*;
pub use registry::*;
pub use replicate::replicate;
pub use serialize::*;
pub use task::Task;
pub use thread::*;
pub use value::*;
pub use vector::*;
