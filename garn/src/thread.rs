use std::{
    collections::VecDeque,
    sync::Arc,
    thread::JoinHandle,
};

use parking_lot::{Condvar, Mutex, RwLock};
use thiserror::Error;

use crate::{
    entry::from_entry,
    task::{marshal_args, Task},
    Interpreter, MarshalError, ProgramState, RuntimeError, ThreadRegistry, Value,
};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ThreadError {
    #[error("thread has already been started")]
    AlreadyStarted,
    #[error("class {0} not found")]
    UnknownClass(String),
    #[error("value of type {0} is not a callable task target")]
    NotCallable(&'static str),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    NotStarted,
    /// The worker is up but still replicating its execution context.
    StartingUp,
    Started,
    Joined,
}

#[derive(Debug)]
struct ThreadCore {
    status: ThreadStatus,
    tasks: VecDeque<Task>,
}

/// State shared between thread handles, the worker, and the registry.
#[derive(Debug)]
pub struct ThreadShared {
    id: u64,
    state: Mutex<ThreadCore>,
    work_ready: Condvar,
    os_handle: Mutex<Option<JoinHandle<()>>>,
    parent_program: Arc<RwLock<ProgramState>>,
    errors: Mutex<Vec<String>>,
}

impl ThreadShared {
    pub(crate) fn status(&self) -> ThreadStatus {
        self.state.lock().status
    }

    /// Flips the status to `Joined`, wakes the worker, and waits for it
    /// to drain its task queue and exit. Safe to call more than once.
    pub(crate) fn join(&self) {
        {
            let mut core = self.state.lock();
            let was = core.status;
            core.status = ThreadStatus::Joined;
            if was == ThreadStatus::NotStarted {
                return;
            }
        }
        self.work_ready.notify_all();
        let handle = self.os_handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("worker {} panicked", self.id);
            }
        }
    }
}

/// Handle to one worker thread. Cloning is cheap and every clone
/// addresses the same worker. Tasks are dispatched strictly in the
/// order they were added.
#[derive(Debug, Clone)]
pub struct Thread {
    shared: Arc<ThreadShared>,
    registry: ThreadRegistry,
}

impl Thread {
    /// Creates a thread bound to `program`. The worker replicates that
    /// context once it starts; mutations made after the replica is
    /// taken are invisible to it. The thread is tracked by `registry`
    /// until joined.
    pub(crate) fn create(program: Arc<RwLock<ProgramState>>, registry: ThreadRegistry) -> Self {
        let shared = Arc::new(ThreadShared {
            id: registry.next_id(),
            state: Mutex::new(ThreadCore {
                status: ThreadStatus::NotStarted,
                tasks: VecDeque::new(),
            }),
            work_ready: Condvar::new(),
            os_handle: Mutex::new(None),
            parent_program: program,
            errors: Mutex::new(Vec::new()),
        });
        registry.register(shared.id, shared.clone());
        Self { shared, registry }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn status(&self) -> ThreadStatus {
        self.shared.status()
    }

    pub fn task_count(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Messages of tasks that failed on the worker, in completion order.
    pub fn task_errors(&self) -> Vec<String> {
        self.shared.errors.lock().clone()
    }

    /// Queues a task that instantiates `class` with `args` and invokes
    /// the instance's entry method. The class must exist in the
    /// creating context; arguments are marshaled here, and the first
    /// unmarshalable one rejects the whole task.
    pub fn add_class_task(&self, class: &str, args: &[Value]) -> Result<(), ThreadError> {
        if self
            .shared
            .parent_program
            .read()
            .lookup_class(class)
            .is_none()
        {
            return Err(ThreadError::UnknownClass(class.to_owned()));
        }
        let args = marshal_args(args)?;
        self.enqueue(Task::Class {
            name: class.to_owned(),
            args,
        });
        Ok(())
    }

    /// Queues a task that invokes a callable: a function name, a
    /// closure, or an `[object, method]` pair.
    pub fn add_function_task(&self, callable: &Value, args: &[Value]) -> Result<(), ThreadError> {
        match callable {
            Value::Str(_) | Value::Closure(_) | Value::Array(_) => {}
            other => return Err(ThreadError::NotCallable(other.type_name())),
        }
        let callable = marshal_args(std::slice::from_ref(callable))?.remove(0);
        let args = marshal_args(args)?;
        self.enqueue(Task::Function { callable, args });
        Ok(())
    }

    /// Queues a task that executes the compiled body registered for
    /// `path`, with `args` exposed through the `_THREAD` global.
    pub fn add_file_task(&self, path: &str, args: &[Value]) -> Result<(), ThreadError> {
        let args = marshal_args(args)?;
        self.enqueue(Task::File {
            path: path.to_owned(),
            args,
        });
        Ok(())
    }

    fn enqueue(&self, task: Task) {
        self.shared.state.lock().tasks.push_back(task);
        self.shared.work_ready.notify_one();
    }

    /// Starts the worker. A thread starts at most once; starting a
    /// started or joined thread is an error.
    pub fn start(&self) -> Result<(), ThreadError> {
        // The state lock is held until the join handle is stored, so a
        // concurrent join can never observe the thread as started while
        // there is no handle to wait on.
        let mut core = self.shared.state.lock();
        if core.status != ThreadStatus::NotStarted {
            return Err(ThreadError::AlreadyStarted);
        }
        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("garn-worker-{}", self.shared.id))
            .spawn(move || worker(shared));
        match spawned {
            Ok(handle) => {
                core.status = ThreadStatus::StartingUp;
                *self.shared.os_handle.lock() = Some(handle);
                Ok(())
            }
            Err(err) => Err(ThreadError::Spawn(err.to_string())),
        }
    }

    /// Waits for the worker to finish every queued task, then stops
    /// tracking the thread. Tasks added before this call are all
    /// executed; the worker only exits on an empty queue.
    pub fn join(&self) {
        self.shared.join();
        self.registry.deregister(self.shared.id);
    }
}

fn worker(shared: Arc<ThreadShared>) {
    log::debug!("worker {} replicating execution context", shared.id);
    let mut interp = Interpreter::child_of(&shared.parent_program);
    {
        let mut core = shared.state.lock();
        // A join can land before startup completes; never undo it.
        if core.status == ThreadStatus::StartingUp {
            core.status = ThreadStatus::Started;
        }
    }
    log::debug!("worker {} ready", shared.id);
    loop {
        let task = {
            let mut core = shared.state.lock();
            loop {
                if let Some(task) = core.tasks.pop_front() {
                    break Some(task);
                }
                if core.status == ThreadStatus::Joined {
                    break None;
                }
                shared.work_ready.wait(&mut core);
            }
        };
        let Some(task) = task else {
            break;
        };
        // A failed task is reported and the worker moves on.
        if let Err(err) = execute_task(&mut interp, task) {
            interp.report_task_error(&err);
            shared.errors.lock().push(err.to_string());
        }
    }
    log::debug!("worker {} exiting", shared.id);
}

fn execute_task(interp: &mut Interpreter, task: Task) -> Result<(), RuntimeError> {
    match task {
        Task::Class { name, args } => {
            let args = unmarshal_args(args)?;
            let instance = interp.instantiate(&name, &args)?;
            let Value::Object(object) = instance else {
                return Err(RuntimeError::TypeError {
                    expected: "object",
                    found: instance.type_name(),
                });
            };
            interp.run_object(&object)?;
        }
        Task::Function { callable, args } => {
            let callable = from_entry(callable)?;
            let args = unmarshal_args(args)?;
            interp.call_value(&callable, &args)?;
        }
        Task::File { path, args } => {
            let args = unmarshal_args(args)?;
            interp.execute_file(&path, args)?;
        }
    }
    Ok(())
}

fn unmarshal_args(args: Vec<crate::Entry>) -> Result<Vec<Value>, MarshalError> {
    args.into_iter().map(from_entry).collect()
}
