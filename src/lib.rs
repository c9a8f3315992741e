//! Inject-Flow: hierarchical dependency injection coupled with a reactive
//! signal graph.
//!
//! Injectors form a tree. Each one owns an immutable provider table and a
//! cache of lazily constructed singletons; lookups walk toward the root and
//! fall back to a token's default factory. The same [`Runtime`] that owns
//! the injectors also owns a glitch-free reactive graph of signals, computed
//! values and effects, a coalescing effect scheduler and a local executor
//! that drives async [`Resource`] loaders.
//!
//! # Key Features
//!
//! - **Hierarchical resolution**: `SELF`, `SKIP_SELF` and `OPTIONAL` lookups, multi providers, aliases
//! - **Cycle detection**: cyclic construction fails with the full token path
//! - **Default factories**: tokens can be injected without any provider, cached in the right scope
//! - **Glitch-free reactivity**: effects see a consistent graph and run once per flush
//! - **Equality cutoff**: a recomputation producing an equal value does not propagate
//! - **Cancellable resources**: superseded async loads never publish their result
//! - **Scoped teardown**: destroying an injector destroys every effect and resource under it
//!
//! # Example
//!
//! ```ignore
//! use inject_flow::{Dep, EffectOptions, Provider, Runtime, Token};
//!
//! let greeting: Token<String> = Token::new("GREETING");
//! let name: Token<String> = Token::new("NAME");
//!
//! let runtime = Runtime::new();
//! let root = runtime.create_root_injector(vec![
//!     Provider::value(&name, "world".to_string()),
//!     Provider::factory(&greeting, vec![Dep::new(&name)], |_ctx, args| {
//!         Ok(format!("hello, {}", args.get::<String>(0)?))
//!     }),
//! ])?;
//! assert_eq!(*root.get(&greeting)?, "hello, world");
//!
//! let count = runtime.signal(0);
//! let doubled = runtime.computed({
//!     let count = count.clone();
//!     move || count.get() * 2
//! });
//! runtime.effect_with(
//!     move |_| {
//!         println!("doubled = {}", doubled.get());
//!         Ok(())
//!     },
//!     EffectOptions::new().injector(&root),
//! )?;
//! count.set(21);
//! runtime.flush_effects()?; // prints "doubled = 42"
//! ```

mod context;
mod destroy;
mod error;
mod injector;
mod pending;
mod provider;
mod reactive;
mod resource;
mod runtime;
mod scheduler;
mod token;
pub mod tracer;

pub use context::{
    assert_in_injection_context, current_injector, request_injection, request_injection_with,
    run_in_injection_context, InjectionContext,
};
pub use destroy::{DestroyHandle, DestroyRef, OnDestroy};
pub use error::{InjectError, Result};
pub use injector::{
    injector_scope, provide_environment_initializer, EnvironmentInitializer, Injector,
    InjectorOptions, NullInjector, WeakInjector,
};
pub use pending::{PendingTask, PendingTasks};
pub use provider::{Args, ClassFactory, Declaration, Dep, DepPart, InjectFlags, Provider};
pub use reactive::{
    untracked, Computed, EffectCleanup, EffectOptions, EffectRef, LinkedSignal, Previous,
    ReadSignal, Signal,
};
pub use resource::{
    AbortSignal, LoaderParams, Resource, ResourceLoader, ResourceOptions, ResourceStatus,
};
pub use runtime::{
    reset_error_hook, set_error_hook, DefaultPlacement, ErrorHandler, ErrorHook, GlobalErrorHook,
    Runtime, RuntimeBuilder,
};
pub use scheduler::DEFAULT_MAX_FLUSH_ITERATIONS;
pub use token::{ForwardRef, HomeScope, Token, TokenId};
pub use tracer::{NoopTracer, Tracer};
