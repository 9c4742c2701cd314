use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{ClassDef, ClassKind, Function, FunctionDef, MagicSlots, ProgramState};

/// Per-replication table of duplicated filename strings. Functions
/// compiled from one source file share one allocation in the child,
/// and no child filename aliases parent memory.
#[derive(Default)]
struct FilenameInterner {
    map: HashMap<String, Arc<str>>,
}

impl FilenameInterner {
    fn intern(&mut self, filename: &str) -> Arc<str> {
        if let Some(interned) = self.map.get(filename) {
            return interned.clone();
        }
        let fresh: Arc<str> = Arc::from(filename);
        self.map.insert(filename.to_owned(), fresh.clone());
        fresh
    }
}

fn copy_function(func: &Function, filenames: &mut FilenameInterner) -> Function {
    Function {
        name: func.name.clone(),
        owner: func.owner.clone(),
        filename: filenames.intern(&func.filename),
        params: func.params.clone(),
        code: func.code.clone(),
        literals: func.literals.clone(),
        statics: func.statics.clone(),
    }
}

/// Copies a class and, first, every class it links to. Internal
/// classes are never copied; the child's own registration is used.
/// `seen` breaks cycles in malformed link graphs.
fn copy_class(
    name: &str,
    parent: &ProgramState,
    child: &mut ProgramState,
    filenames: &mut FilenameInterner,
    seen: &mut HashSet<String>,
) {
    let key = name.to_ascii_lowercase();
    if child.classes.contains_key(&key) || !seen.insert(key.clone()) {
        return;
    }
    let Some(def) = parent.classes.get(&key) else {
        return;
    };
    if def.kind == ClassKind::Internal {
        return;
    }

    if let Some(parent_name) = &def.parent {
        copy_class(parent_name, parent, child, filenames, seen);
    }
    for linked in def.interfaces.iter().chain(&def.traits) {
        copy_class(linked, parent, child, filenames, seen);
    }

    let methods: Vec<Function> = def
        .methods
        .iter()
        .map(|m| copy_function(m, filenames))
        .collect();
    // Slots are re-resolved against the copied method list, never
    // carried over as indices.
    let magic = MagicSlots::resolve(&methods);
    child.classes.insert(
        key,
        ClassDef {
            kind: def.kind,
            name: def.name.clone(),
            parent: def.parent.clone(),
            interfaces: def.interfaces.clone(),
            traits: def.traits.clone(),
            constants: def.constants.clone(),
            default_properties: def.default_properties.clone(),
            methods,
            magic,
        },
    );
}

/// Populates a freshly bootstrapped child context from a parent. The
/// child afterwards shares no mutable state with the parent: user
/// functions, classes and file bodies are deep copies, internal
/// definitions resolve to the child's own registrations, and constants
/// already defined in the child win over the parent's.
pub fn replicate(parent: &ProgramState, child: &mut ProgramState) {
    let mut filenames = FilenameInterner::default();

    for (key, def) in &parent.functions {
        if child.functions.contains_key(key) {
            continue;
        }
        // Internal functions are looked up in the child, not copied.
        if let FunctionDef::User(func) = def {
            child
                .functions
                .insert(key.clone(), FunctionDef::User(copy_function(func, &mut filenames)));
        }
    }

    let mut seen = HashSet::new();
    let class_names: Vec<&String> = parent.classes.keys().collect();
    for name in class_names {
        copy_class(name, parent, child, &mut filenames, &mut seen);
    }

    for (name, constant) in &parent.constants {
        if child.has_constant_like(name) {
            continue;
        }
        child.constants.insert(name.clone(), constant.clone());
    }

    for (path, unit) in &parent.units {
        if child.units.contains_key(path) {
            continue;
        }
        child
            .units
            .insert(path.clone(), copy_function(unit, &mut filenames));
    }

    for path in &parent.included_files {
        child.included_files.insert(path.clone());
    }

    // Replay only the parent's deliberate overrides of entries the
    // child also knows about.
    for (name, entry) in &parent.ini {
        let Some(own) = child.ini.get_mut(name) else {
            continue;
        };
        if own.value == entry.value {
            continue;
        }
        if !own.modified {
            own.orig_value = Some(own.value.clone());
            own.modified = true;
        }
        own.value = entry.value.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Constant, IniEntry, Op, Plain};

    fn parent_with_function() -> ProgramState {
        let mut parent = ProgramState::default();
        let mut func = Function::new("work", "/src/main.script");
        func.code = vec![Op::PushLiteral(0), Op::Return];
        func.literals = vec![Plain::Int(42)];
        parent.functions.insert("work".into(), FunctionDef::User(func));
        parent
    }

    #[test]
    fn user_functions_are_deep_copied() {
        let parent = parent_with_function();
        let mut child = ProgramState::default();
        replicate(&parent, &mut child);

        let FunctionDef::User(copy) = child.lookup_function("work").unwrap() else {
            panic!("expected user function");
        };
        let FunctionDef::User(orig) = parent.lookup_function("work").unwrap() else {
            unreachable!();
        };
        assert_eq!(copy, orig);
        // Fresh filename allocation, not a shared one.
        assert!(!Arc::ptr_eq(&copy.filename, &orig.filename));
    }

    #[test]
    fn filenames_intern_within_the_child() {
        let mut parent = ProgramState::default();
        parent
            .functions
            .insert("a".into(), FunctionDef::User(Function::new("a", "/src/lib.script")));
        parent
            .functions
            .insert("b".into(), FunctionDef::User(Function::new("b", "/src/lib.script")));
        let mut child = ProgramState::default();
        replicate(&parent, &mut child);

        let (FunctionDef::User(a), FunctionDef::User(b)) = (
            child.lookup_function("a").unwrap(),
            child.lookup_function("b").unwrap(),
        ) else {
            panic!("expected user functions");
        };
        assert!(Arc::ptr_eq(&a.filename, &b.filename));
    }

    #[test]
    fn internal_definitions_resolve_locally() {
        let mut parent = ProgramState::default();
        parent
            .classes
            .insert("stdclass".into(), ClassDef::internal("stdClass"));
        let mut child = ProgramState::default();
        let own = ClassDef::internal("stdClass");
        child.classes.insert("stdclass".into(), own);
        replicate(&parent, &mut child);
        // Still exactly one registration, the child's own.
        assert_eq!(child.classes.len(), 1);
    }

    #[test]
    fn class_graph_copies_parents_first_and_rebinds_magic() {
        let mut parent = ProgramState::default();
        let mut base = ClassDef::new("Worker");
        base.methods.push(Function::new("run", "w.script"));
        base.magic = MagicSlots::resolve(&base.methods);
        let mut derived = ClassDef::new("LoudWorker");
        derived.parent = Some("worker".into());
        derived.methods.push(Function::new("__construct", "w.script"));
        derived.methods.push(Function::new("run", "w.script"));
        derived.magic = MagicSlots::resolve(&derived.methods);
        parent.classes.insert("worker".into(), base);
        parent.classes.insert("loudworker".into(), derived);

        let mut child = ProgramState::default();
        replicate(&parent, &mut child);

        assert!(child.lookup_class("Worker").is_some());
        let copy = child.lookup_class("LoudWorker").unwrap();
        assert_eq!(copy.magic.constructor, Some(0));
        assert_eq!(copy.magic.run, Some(1));
        let (owner, _) = child.find_method("LoudWorker", "run").unwrap();
        assert_eq!(owner.name, "LoudWorker");
    }

    #[test]
    fn existing_constants_win_case_insensitively() {
        let mut parent = ProgramState::default();
        parent.constants.insert(
            "Limit".into(),
            Constant {
                name: "Limit".into(),
                value: Plain::Int(99),
            },
        );
        parent.constants.insert(
            "OTHER".into(),
            Constant {
                name: "OTHER".into(),
                value: Plain::Int(1),
            },
        );
        let mut child = ProgramState::default();
        child.constants.insert(
            "LIMIT".into(),
            Constant {
                name: "LIMIT".into(),
                value: Plain::Int(10),
            },
        );
        replicate(&parent, &mut child);
        assert_eq!(child.constants["LIMIT"].value, Plain::Int(10));
        assert!(!child.constants.contains_key("Limit"));
        assert_eq!(child.constants["OTHER"].value, Plain::Int(1));
    }

    #[test]
    fn ini_overrides_replay_with_bookkeeping() {
        let mut parent = ProgramState::default();
        parent.ini.insert(
            "precision".into(),
            IniEntry {
                value: "17".into(),
                modified: true,
                orig_value: Some("14".into()),
            },
        );
        parent
            .ini
            .insert("unknown_to_child".into(), IniEntry::new("x"));
        let mut child = ProgramState::default();
        child.ini.insert("precision".into(), IniEntry::new("14"));
        replicate(&parent, &mut child);

        let entry = &child.ini["precision"];
        assert_eq!(entry.value, "17");
        assert!(entry.modified);
        assert_eq!(entry.orig_value.as_deref(), Some("14"));
        // Entries the child has no registration for are not invented.
        assert!(!child.ini.contains_key("unknown_to_child"));
    }

    #[test]
    fn mutations_after_replication_stay_invisible() {
        let mut parent = parent_with_function();
        let mut child = ProgramState::default();
        replicate(&parent, &mut child);

        parent
            .functions
            .insert("late".into(), FunctionDef::User(Function::new("late", "l.script")));
        if let Some(FunctionDef::User(f)) = parent.functions.get_mut("work") {
            f.literals[0] = Plain::Int(0);
        }

        assert!(child.lookup_function("late").is_none());
        let FunctionDef::User(copy) = child.lookup_function("work").unwrap() else {
            panic!("expected user function");
        };
        assert_eq!(copy.literals[0], Plain::Int(42));
    }
}
