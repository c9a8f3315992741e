//! Tests for effect scheduling, error routing and teardown.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Mutex;

use inject_flow::{
    reset_error_hook, run_in_injection_context, set_error_hook, Dep, EffectOptions, ErrorHandler,
    InjectError, Provider, Runtime, Token, Tracer,
};

// =============================================================================
// Ordering and Coalescing
// =============================================================================

#[test]
fn test_effects_run_in_creation_order() {
    let runtime = Runtime::new();
    let root = runtime.create_root_injector(vec![]).unwrap();
    let trigger = runtime.signal(0);
    let log: Rc<RefCell<Vec<&'static str>>> = Rc::default();

    for name in ["first", "second", "third"] {
        let (trigger, log) = (trigger.clone(), log.clone());
        runtime
            .effect_with(
                move |_| {
                    trigger.get();
                    log.borrow_mut().push(name);
                    Ok(())
                },
                EffectOptions::new().injector(&root),
            )
            .unwrap();
    }
    runtime.flush_effects().unwrap();
    trigger.set(1);
    runtime.flush_effects().unwrap();

    assert_eq!(
        *log.borrow(),
        vec!["first", "second", "third", "first", "second", "third"]
    );
}

#[test]
fn test_flush_request_is_coalesced() {
    let requests = Rc::new(Cell::new(0));
    let counter = requests.clone();
    let runtime = Runtime::builder()
        .on_flush_requested(move || counter.set(counter.get() + 1))
        .build();
    let root = runtime.create_root_injector(vec![]).unwrap();
    let count = runtime.signal(0);

    let source = count.clone();
    runtime
        .effect_with(
            move |_| {
                source.get();
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();
    assert_eq!(requests.get(), 1);
    runtime.flush_effects().unwrap();

    count.set(1);
    count.set(2);
    count.set(3);
    assert_eq!(requests.get(), 2);
    assert!(runtime.has_pending_effects());

    runtime.flush_effects().unwrap();
    assert!(!runtime.has_pending_effects());
}

#[test]
fn test_nested_flush_is_ignored() {
    let runtime = Runtime::new();
    let root = runtime.create_root_injector(vec![]).unwrap();
    let results: Rc<RefCell<Vec<bool>>> = Rc::default();

    let (inner_runtime, sink) = (runtime.clone(), results.clone());
    runtime
        .effect_with(
            move |_| {
                sink.borrow_mut().push(inner_runtime.flush_effects().is_ok());
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();
    runtime.flush_effects().unwrap();

    assert_eq!(*results.borrow(), vec![true]);
}

// =============================================================================
// Runaway Protection
// =============================================================================

#[test]
fn test_self_triggering_effect_hits_iteration_cap() {
    let runtime = Runtime::builder().max_flush_iterations(5).build();
    let root = runtime.create_root_injector(vec![]).unwrap();
    let count = runtime.signal(0);

    let source = count.clone();
    runtime
        .effect_with(
            move |_| {
                source.set(source.get() + 1);
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();

    match runtime.flush_effects() {
        Err(InjectError::SchedulerRunaway { iterations }) => assert_eq!(iterations, 5),
        other => panic!("expected runaway, got {other:?}"),
    }
    assert_eq!(count.get(), 5);
    assert!(!runtime.has_pending_effects());

    // the scheduler stays usable
    runtime.flush_effects().unwrap();
    assert_eq!(count.get(), 5);
}

#[test]
fn test_effect_behind_computed_runs_again_after_runaway() {
    let runtime = Runtime::builder().max_flush_iterations(3).build();
    let root = runtime.create_root_injector(vec![]).unwrap();
    let count = runtime.signal(0);
    let mirrored = runtime.computed({
        let count = count.clone();
        move || count.get()
    });
    let runs = Rc::new(Cell::new(0));

    let (source, derived, counter) = (count.clone(), mirrored.clone(), runs.clone());
    runtime
        .effect_with(
            move |_| {
                counter.set(counter.get() + 1);
                let value = derived.get();
                if value < 10 {
                    source.set(value + 1);
                }
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();

    assert!(matches!(
        runtime.flush_effects(),
        Err(InjectError::SchedulerRunaway { iterations: 3 })
    ));
    assert_eq!(runs.get(), 3);
    assert!(!runtime.has_pending_effects());

    count.set(100);
    assert!(runtime.has_pending_effects());
    runtime.flush_effects().unwrap();
    assert_eq!(runs.get(), 4);
    assert_eq!(mirrored.get(), 100);
}

#[test]
fn test_ping_pong_effects_hit_iteration_cap() {
    let runtime = Runtime::builder().max_flush_iterations(10).build();
    let root = runtime.create_root_injector(vec![]).unwrap();
    let ping = runtime.signal(0);
    let pong = runtime.signal(0);

    let (read, write) = (ping.clone(), pong.clone());
    runtime
        .effect_with(
            move |_| {
                write.set(read.get() + 1);
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();
    let (read, write) = (pong.clone(), ping.clone());
    runtime
        .effect_with(
            move |_| {
                write.set(read.get() + 1);
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();

    assert!(matches!(
        runtime.flush_effects(),
        Err(InjectError::SchedulerRunaway { .. })
    ));
}

// =============================================================================
// Error Routing
// =============================================================================

#[test]
fn test_effect_error_goes_to_runtime_hook() {
    let errors: Rc<RefCell<Vec<String>>> = Rc::default();
    let sink = errors.clone();
    let runtime = Runtime::builder()
        .error_hook(move |err| sink.borrow_mut().push(err.to_string()))
        .build();
    let root = runtime.create_root_injector(vec![]).unwrap();
    let ran_after = Rc::new(Cell::new(false));

    runtime
        .effect_with(
            |_| anyhow::bail!("effect exploded"),
            EffectOptions::new().injector(&root),
        )
        .unwrap();
    let flag = ran_after.clone();
    runtime
        .effect_with(
            move |_| {
                flag.set(true);
                Ok(())
            },
            EffectOptions::new().injector(&root),
        )
        .unwrap();

    runtime.flush_effects().unwrap();
    assert_eq!(*errors.borrow(), vec!["effect exploded"]);
    assert!(ran_after.get());
}

#[test]
fn test_effect_error_goes_to_provided_handler() {
    let hooked: Rc<RefCell<Vec<String>>> = Rc::default();
    let handled: Rc<RefCell<Vec<String>>> = Rc::default();

    let sink = hooked.clone();
    let runtime = Runtime::builder()
        .error_hook(move |err| sink.borrow_mut().push(err.to_string()))
        .build();
    let sink = handled.clone();
    let root = runtime
        .create_root_injector(vec![Provider::value(
            &ErrorHandler::token(),
            ErrorHandler::new(move |err| sink.borrow_mut().push(err.to_string())),
        )])
        .unwrap();
    let child = root.create_child(vec![]).unwrap();

    runtime
        .effect_with(
            |_| anyhow::bail!("handled by root"),
            EffectOptions::new().injector(&child),
        )
        .unwrap();
    runtime.flush_effects().unwrap();

    assert_eq!(*handled.borrow(), vec!["handled by root"]);
    assert!(hooked.borrow().is_empty());
}

static GLOBAL_ERRORS: Mutex<Vec<String>> = Mutex::new(Vec::new());

#[test]
fn test_effect_error_goes_to_global_hook() {
    set_error_hook(|err| {
        if let Ok(mut errors) = GLOBAL_ERRORS.lock() {
            errors.push(err.to_string());
        }
    });

    let runtime = Runtime::new();
    let root = runtime.create_root_injector(vec![]).unwrap();
    runtime
        .effect_with(
            |_| anyhow::bail!("global hook test error"),
            EffectOptions::new().injector(&root),
        )
        .unwrap();
    runtime.flush_effects().unwrap();
    reset_error_hook();

    let errors = GLOBAL_ERRORS.lock().unwrap();
    assert!(errors.iter().any(|e| e == "global hook test error"));
}

// =============================================================================
// Teardown
// =============================================================================

#[test]
fn test_destroying_injector_stops_its_effects() {
    let runtime = Runtime::new();
    let root = runtime.create_root_injector(vec![]).unwrap();
    let child = root.create_child(vec![]).unwrap();
    let count = runtime.signal(0);
    let log: Rc<RefCell<Vec<String>>> = Rc::default();

    for (name, owner) in [("root", &root), ("child", &child)] {
        let (source, sink) = (count.clone(), log.clone());
        run_in_injection_context(owner, |ctx| {
            ctx.runtime().effect(move |cleanup| {
                sink.borrow_mut().push(format!("{name} {}", source.get()));
                let sink = sink.clone();
                cleanup.on_cleanup(move || sink.borrow_mut().push(format!("{name} cleanup")));
                Ok(())
            })
        })
        .unwrap();
    }
    runtime.flush_effects().unwrap();
    assert_eq!(runtime.effect_count(), 2);

    child.destroy();
    assert_eq!(runtime.effect_count(), 1);
    count.set(1);
    runtime.flush_effects().unwrap();

    assert_eq!(
        *log.borrow(),
        vec![
            "root 0",
            "child 0",
            "child cleanup",
            "root cleanup",
            "root 1"
        ]
    );
}

#[test]
fn test_effect_created_in_destroyed_injector_fails() {
    let runtime = Runtime::new();
    let root = runtime.create_root_injector(vec![]).unwrap();
    root.destroy();

    let result = runtime.effect_with(|_| Ok(()), EffectOptions::new().injector(&root));
    assert!(matches!(result, Err(InjectError::InjectorDestroyed { .. })));
    assert_eq!(runtime.effect_count(), 0);
}

// =============================================================================
// Tracer
// =============================================================================

#[derive(Default)]
struct Events {
    flushes: Cell<usize>,
    effect_runs: Cell<usize>,
    cycles: RefCell<Vec<Vec<String>>>,
    destroyed: RefCell<Vec<String>>,
}

struct RecordingTracer(Rc<Events>);

impl Tracer for RecordingTracer {
    fn on_cycle_detected(&self, path: &[String]) {
        self.0.cycles.borrow_mut().push(path.to_vec());
    }

    fn on_injector_destroyed(&self, injector: &str) {
        self.0.destroyed.borrow_mut().push(injector.to_string());
    }

    fn on_effect_run(&self, _effect: u64) {
        self.0.effect_runs.set(self.0.effect_runs.get() + 1);
    }

    fn on_flush(&self, _iteration: usize, _effects: usize) {
        self.0.flushes.set(self.0.flushes.get() + 1);
    }
}

#[test]
fn test_tracer_observes_runtime_events() {
    let events = Rc::new(Events::default());
    let runtime = Runtime::builder()
        .tracer(RecordingTracer(events.clone()))
        .build();
    let a: Token<u32> = Token::new("A");
    let root = runtime
        .create_root_injector(vec![Provider::factory(
            &a,
            vec![Dep::new(&a)],
            |_ctx, args| Ok(*args.get::<u32>(0)?),
        )])
        .unwrap();

    assert!(root.get(&a).is_err());
    assert_eq!(*events.cycles.borrow(), vec![vec!["A".to_string(), "A".to_string()]]);

    runtime
        .effect_with(|_| Ok(()), EffectOptions::new().injector(&root))
        .unwrap();
    runtime.flush_effects().unwrap();
    assert_eq!(events.flushes.get(), 1);
    assert_eq!(events.effect_runs.get(), 1);

    root.destroy();
    assert_eq!(*events.destroyed.borrow(), vec!["root"]);
}
