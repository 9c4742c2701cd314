use crate::{entry::to_entry, Entry, MarshalError, Value};

/// One unit of work queued on a thread. Arguments are marshaled at
/// enqueue time on the creator's side; the worker unmarshals them
/// against its own interpreter.
#[derive(Debug, Clone)]
pub enum Task {
    /// Instantiate `name`, passing `args` to the constructor, then
    /// invoke the instance's entry method.
    Class { name: String, args: Vec<Entry> },
    /// Invoke a callable with `args`.
    Function { callable: Entry, args: Vec<Entry> },
    /// Execute the compiled body of a source file, exposing `args`
    /// through the `_THREAD` global.
    File { path: String, args: Vec<Entry> },
}

/// Marshals an argument list in order. The first failure aborts the
/// whole list; entries marshaled so far are released and nothing is
/// handed to the thread.
pub(crate) fn marshal_args(args: &[Value]) -> Result<Vec<Entry>, MarshalError> {
    let mut entries = Vec::with_capacity(args.len());
    for arg in args {
        entries.push(to_entry(arg)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_bad_argument_aborts_the_list() {
        let args = [Value::Int(1), Value::Resource(9), Value::Int(2)];
        assert!(matches!(
            marshal_args(&args),
            Err(MarshalError::Unserializable("resource"))
        ));
    }

    #[test]
    fn marshals_in_order() {
        let entries = marshal_args(&[Value::Int(1), Value::str("a")]).unwrap();
        assert!(matches!(entries[0], Entry::Int(1)));
        assert!(matches!(entries[1], Entry::Str(_)));
    }
}
