//! Tests for signals, computed values, linked signals and effects.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use inject_flow::{
    run_in_injection_context, untracked, Computed, EffectOptions, InjectError, Injector, Previous,
    Runtime,
};

fn setup() -> (Runtime, Injector) {
    let runtime = Runtime::new();
    let root = runtime.create_root_injector(vec![]).unwrap();
    (runtime, root)
}

// =============================================================================
// Signals
// =============================================================================

#[test]
fn test_signal_get_set_update() {
    let (runtime, _root) = setup();
    let count = runtime.signal(1);

    assert_eq!(count.get(), 1);
    count.set(2);
    count.update(|n| n * 10);
    assert_eq!(count.get(), 20);
    assert_eq!(count.as_readonly().get(), 20);
}

#[test]
fn test_equal_write_does_not_notify() {
    let (runtime, root) = setup();
    let count = runtime.signal(1);
    let runs = Rc::new(Cell::new(0));

    let source = count.clone();
    let counter = runs.clone();
    runtime
        .effect_with(
            move |_| {
                source.get();
                counter.set(counter.get() + 1);
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();
    runtime.flush_effects().unwrap();
    assert_eq!(runs.get(), 1);

    count.set(1);
    assert!(!runtime.has_pending_effects());
    runtime.flush_effects().unwrap();
    assert_eq!(runs.get(), 1);
}

#[test]
fn test_custom_equality() {
    let (runtime, root) = setup();
    // case-insensitive comparison
    let name = runtime.signal_with_equal("Ada".to_string(), |a, b| {
        a.eq_ignore_ascii_case(b)
    });
    let runs = Rc::new(Cell::new(0));

    let source = name.clone();
    let counter = runs.clone();
    runtime
        .effect_with(
            move |_| {
                source.with(|_| ());
                counter.set(counter.get() + 1);
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();
    runtime.flush_effects().unwrap();

    name.set("ADA".to_string());
    runtime.flush_effects().unwrap();
    assert_eq!(runs.get(), 1);
    assert_eq!(name.get(), "Ada");

    name.set("Grace".to_string());
    runtime.flush_effects().unwrap();
    assert_eq!(runs.get(), 2);
}

#[test]
fn test_dropped_nodes_leave_the_graph() {
    let (runtime, _root) = setup();
    let before = runtime.node_count();
    {
        let a = runtime.signal(1);
        let doubled = runtime.computed({
            let a = a.clone();
            move || a.get() * 2
        });
        assert_eq!(doubled.get(), 2);
        assert_eq!(runtime.node_count(), before + 2);
    }
    assert_eq!(runtime.node_count(), before);
}

// =============================================================================
// Computed
// =============================================================================

#[test]
fn test_computed_is_lazy_and_memoized() {
    let (runtime, _root) = setup();
    let a = runtime.signal(2);
    let computations = Rc::new(Cell::new(0));

    let counter = computations.clone();
    let source = a.clone();
    let squared = runtime.computed(move || {
        counter.set(counter.get() + 1);
        source.get() * source.get()
    });
    assert_eq!(computations.get(), 0);

    assert_eq!(squared.get(), 4);
    assert_eq!(squared.get(), 4);
    assert_eq!(computations.get(), 1);

    a.set(3);
    assert_eq!(computations.get(), 1);
    assert_eq!(squared.get(), 9);
    assert_eq!(computations.get(), 2);
}

#[test]
fn test_computed_chain() {
    let (runtime, _root) = setup();
    let a = runtime.signal(1);
    let b = runtime.computed({
        let a = a.clone();
        move || a.get() + 1
    });
    let c = runtime.computed({
        let b = b.clone();
        move || b.get() * 10
    });

    assert_eq!(c.get(), 20);
    a.set(4);
    assert_eq!(c.get(), 50);
}

#[test]
fn test_equality_cutoff_stops_propagation() {
    let (runtime, root) = setup();
    let n = runtime.signal(1);
    let parity_runs = Rc::new(Cell::new(0));
    let effect_runs = Rc::new(Cell::new(0));

    let source = n.clone();
    let counter = parity_runs.clone();
    let is_odd = runtime.computed(move || {
        counter.set(counter.get() + 1);
        source.get() % 2 == 1
    });

    let counter = effect_runs.clone();
    runtime
        .effect_with(
            move |_| {
                is_odd.get();
                counter.set(counter.get() + 1);
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();
    runtime.flush_effects().unwrap();
    assert_eq!(effect_runs.get(), 1);

    n.set(3);
    runtime.flush_effects().unwrap();
    // recomputed, but the equal result does not re-run the effect
    assert_eq!(parity_runs.get(), 2);
    assert_eq!(effect_runs.get(), 1);

    n.set(4);
    runtime.flush_effects().unwrap();
    assert_eq!(effect_runs.get(), 2);
}

#[test]
fn test_dynamic_dependencies_are_pruned() {
    let (runtime, _root) = setup();
    let use_a = runtime.signal(true);
    let a = runtime.signal(1);
    let b = runtime.signal(100);
    let computations = Rc::new(Cell::new(0));

    let counter = computations.clone();
    let picked = runtime.computed({
        let (use_a, a, b) = (use_a.clone(), a.clone(), b.clone());
        move || {
            counter.set(counter.get() + 1);
            if use_a.get() {
                a.get()
            } else {
                b.get()
            }
        }
    });

    assert_eq!(picked.get(), 1);
    use_a.set(false);
    assert_eq!(picked.get(), 100);
    assert_eq!(computations.get(), 2);

    // `a` is no longer a dependency
    a.set(2);
    assert_eq!(picked.get(), 100);
    assert_eq!(computations.get(), 2);

    b.set(200);
    assert_eq!(picked.get(), 200);
    assert_eq!(computations.get(), 3);
}

#[test]
#[should_panic(expected = "cycle detected")]
fn test_computed_reading_itself_panics() {
    let (runtime, _root) = setup();
    let slot: Rc<RefCell<Option<Computed<i32>>>> = Rc::default();

    let inner = slot.clone();
    let looping = runtime.computed(move || {
        let this = inner.borrow().clone();
        this.map_or(0, |c| c.get()) + 1
    });
    *slot.borrow_mut() = Some(looping.clone());

    looping.get();
}

// =============================================================================
// Linked Signals
// =============================================================================

#[test]
fn test_linked_signal_resets_on_source_change() {
    let (runtime, _root) = setup();
    let options = runtime.signal(vec!["a", "b", "c"]);
    let selected = runtime.linked_signal(
        {
            let options = options.clone();
            move || options.get()
        },
        |options: Vec<&'static str>, _previous| options[0],
    );

    assert_eq!(selected.get(), "a");
    selected.set("c");
    assert_eq!(selected.get(), "c");

    options.set(vec!["x", "y"]);
    assert_eq!(selected.get(), "x");
}

#[test]
fn test_linked_signal_sees_previous() {
    let (runtime, _root) = setup();
    let options = runtime.signal(vec![1, 2, 3]);
    let seen: Rc<RefCell<Vec<Option<Previous<Vec<i32>, i32>>>>> = Rc::default();

    let log = seen.clone();
    let selected = runtime.linked_signal(
        {
            let options = options.clone();
            move || options.get()
        },
        move |options: Vec<i32>, previous: Option<Previous<Vec<i32>, i32>>| {
            log.borrow_mut().push(previous.clone());
            // keep the previous choice if it is still available
            match previous {
                Some(previous) if options.contains(&previous.value) => previous.value,
                _ => options[0],
            }
        },
    );

    assert_eq!(selected.get(), 1);
    selected.set(3);
    options.set(vec![3, 4]);
    assert_eq!(selected.get(), 3);
    options.set(vec![5]);
    assert_eq!(selected.get(), 5);

    let seen = seen.borrow();
    assert_eq!(seen.len(), 3);
    assert!(seen[0].is_none());
    assert_eq!(
        seen[1],
        Some(Previous {
            source: vec![1, 2, 3],
            value: 3
        })
    );
}

#[test]
fn test_local_write_to_linked_signal_notifies() {
    let (runtime, root) = setup();
    let source = runtime.signal(1);
    let linked = runtime.linked_signal(
        {
            let source = source.clone();
            move || source.get()
        },
        |value: i32, _previous| value * 10,
    );
    let log: Rc<RefCell<Vec<i32>>> = Rc::default();

    let reader = linked.clone();
    let sink = log.clone();
    runtime
        .effect_with(
            move |_| {
                sink.borrow_mut().push(reader.get());
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();
    runtime.flush_effects().unwrap();

    linked.update(|v| v + 1);
    runtime.flush_effects().unwrap();
    source.set(2);
    runtime.flush_effects().unwrap();

    assert_eq!(*log.borrow(), vec![10, 11, 20]);
}

// =============================================================================
// Effects
// =============================================================================

#[test]
fn test_effect_runs_once_per_flush() {
    let (runtime, root) = setup();
    let count = runtime.signal(0);
    let log: Rc<RefCell<Vec<i32>>> = Rc::default();

    let source = count.clone();
    let sink = log.clone();
    runtime
        .effect_with(
            move |_| {
                sink.borrow_mut().push(source.get());
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();
    // nothing runs before the flush
    assert!(log.borrow().is_empty());
    runtime.flush_effects().unwrap();

    count.set(1);
    count.set(2);
    count.set(3);
    runtime.flush_effects().unwrap();

    assert_eq!(*log.borrow(), vec![0, 3]);
}

#[test]
fn test_diamond_is_glitch_free() {
    let (runtime, root) = setup();
    let s = runtime.signal(1);
    let plus_one = runtime.computed({
        let s = s.clone();
        move || s.get() + 1
    });
    let doubled = runtime.computed({
        let s = s.clone();
        move || s.get() * 2
    });
    let log: Rc<RefCell<Vec<(i32, i32)>>> = Rc::default();

    let sink = log.clone();
    runtime
        .effect_with(
            move |_| {
                sink.borrow_mut().push((plus_one.get(), doubled.get()));
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();
    runtime.flush_effects().unwrap();

    s.set(2);
    runtime.flush_effects().unwrap();

    assert_eq!(*log.borrow(), vec![(2, 2), (3, 4)]);
}

#[test]
fn test_untracked_reads() {
    let (runtime, root) = setup();
    let tracked = runtime.signal(1);
    let ignored = runtime.signal(1);
    let runs = Rc::new(Cell::new(0));

    let (a, b) = (tracked.clone(), ignored.clone());
    let counter = runs.clone();
    runtime
        .effect_with(
            move |_| {
                a.get();
                untracked(|| b.get());
                counter.set(counter.get() + 1);
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();
    runtime.flush_effects().unwrap();

    ignored.set(2);
    runtime.flush_effects().unwrap();
    assert_eq!(runs.get(), 1);

    tracked.set(2);
    runtime.flush_effects().unwrap();
    assert_eq!(runs.get(), 2);
}

#[test]
fn test_effect_cleanup_runs_before_rerun_and_on_destroy() {
    let (runtime, root) = setup();
    let count = runtime.signal(0);
    let log: Rc<RefCell<Vec<String>>> = Rc::default();

    let source = count.clone();
    let sink = log.clone();
    let effect = runtime
        .effect_with(
            move |cleanup| {
                let value = source.get();
                sink.borrow_mut().push(format!("run {value}"));
                let sink = sink.clone();
                cleanup.on_cleanup(move || sink.borrow_mut().push(format!("cleanup {value}")));
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();
    runtime.flush_effects().unwrap();
    count.set(1);
    runtime.flush_effects().unwrap();
    effect.destroy();

    assert!(effect.is_destroyed());
    assert_eq!(
        *log.borrow(),
        vec!["run 0", "cleanup 0", "run 1", "cleanup 1"]
    );

    count.set(2);
    runtime.flush_effects().unwrap();
    assert_eq!(log.borrow().len(), 4);
}

#[test]
fn test_effect_writes_are_seen_in_the_same_flush() {
    let (runtime, root) = setup();
    let input = runtime.signal(1);
    let derived = runtime.signal(0);
    let log: Rc<RefCell<Vec<i32>>> = Rc::default();

    let (source, target) = (input.clone(), derived.clone());
    runtime
        .effect_with(
            move |_| {
                target.set(source.get() * 10);
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();
    let (reader, sink) = (derived.clone(), log.clone());
    runtime
        .effect_with(
            move |_| {
                sink.borrow_mut().push(reader.get());
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();

    runtime.flush_effects().unwrap();
    input.set(2);
    runtime.flush_effects().unwrap();

    assert_eq!(*log.borrow(), vec![10, 20]);
}

#[test]
fn test_effect_requires_injection_context() {
    let (runtime, root) = setup();

    assert!(matches!(
        runtime.effect(|_| Ok(())),
        Err(InjectError::InjectionContext { .. })
    ));

    let in_context = run_in_injection_context(&root, |ctx| ctx.runtime().effect(|_| Ok(())));
    assert!(in_context.is_ok());

    let manual = runtime
        .effect_with(|_| Ok(()), EffectOptions::new().manual_cleanup())
        .unwrap();
    assert_eq!(runtime.effect_count(), 2);
    manual.destroy();
    assert_eq!(runtime.effect_count(), 1);
}

#[test]
fn test_effect_reading_computed_reacts_to_source() {
    let (runtime, root) = setup();
    let first = runtime.signal("Ada".to_string());
    let last = runtime.signal("Lovelace".to_string());
    let full = runtime.computed({
        let (first, last) = (first.clone(), last.clone());
        move || format!("{} {}", first.get(), last.get())
    });
    let log: Rc<RefCell<Vec<String>>> = Rc::default();

    let sink = log.clone();
    let reader = full.clone();
    runtime
        .effect_with(
            move |_| {
                sink.borrow_mut().push(reader.get());
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();
    runtime.flush_effects().unwrap();

    last.set("Byron".to_string());
    runtime.flush_effects().unwrap();

    assert_eq!(*log.borrow(), vec!["Ada Lovelace", "Ada Byron"]);
    assert_eq!(full.get_untracked(), "Ada Byron");
}
