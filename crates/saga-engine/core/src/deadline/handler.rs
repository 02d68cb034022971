//! Deadline handler registration and resolution.
//!
//! A saga declares its deadline handlers up front in a [`DeadlineHandlers`]
//! table. When a deadline fires, exactly one handler runs: the first entry
//! of the table, in this order, that matches the deadline:
//!
//! 1. handlers with an explicit deadline-name filter,
//! 2. then by payload specificity: [`Specificity::Exact`] type matches, then
//!    [`Specificity::Family`] matches by ascending rank, then
//!    [`Specificity::Any`],
//! 3. then by declaration order.
//!
//! The table is kept sorted at registration time so resolution is a linear
//! scan for the first match.

use crate::error::Result;
use crate::event::{Payload, simple_name};
use crate::saga::lifecycle::SagaLifecycle;
use crate::{Error, ErrorKind};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use super::Deadline;

/// Handler invoked with the saga's state, the fired deadline and the
/// lifecycle context of the invocation.
pub type DeadlineHandlerFn<S> =
    Arc<dyn Fn(&mut S, &Deadline, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync>;

/// How specific a payload matcher is. Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Specificity {
    /// Matches exactly one payload type.
    Exact,
    /// Matches a family of payload types; lower rank is more specific.
    Family(u8),
    /// Matches every payload.
    Any,
}

/// Decides whether a handler accepts a payload.
#[derive(Clone)]
pub enum PayloadMatcher {
    Type {
        type_id: TypeId,
        type_name: &'static str,
    },
    Family {
        label: String,
        predicate: Arc<dyn Fn(&Payload) -> bool + Send + Sync>,
    },
    Any,
}

impl PayloadMatcher {
    pub fn of<T: Any>() -> Self {
        PayloadMatcher::Type {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn matches(&self, payload: &Payload) -> bool {
        match self {
            PayloadMatcher::Type { type_id, .. } => payload.type_id() == *type_id,
            PayloadMatcher::Family { predicate, .. } => predicate(payload),
            PayloadMatcher::Any => true,
        }
    }
}

impl fmt::Debug for PayloadMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadMatcher::Type { type_name, .. } => write!(f, "Type({})", simple_name(type_name)),
            PayloadMatcher::Family { label, .. } => write!(f, "Family({})", label),
            PayloadMatcher::Any => write!(f, "Any"),
        }
    }
}

struct Registration<S> {
    name: Option<String>,
    matcher: PayloadMatcher,
    specificity: Specificity,
    order: usize,
    handler: DeadlineHandlerFn<S>,
}

impl<S> Registration<S> {
    fn matches(&self, deadline: &Deadline) -> bool {
        self.name
            .as_deref()
            .is_none_or(|name| name == deadline.name)
            && self.matcher.matches(&deadline.payload)
    }
}

fn erase<S, F>(handler: F) -> DeadlineHandlerFn<S>
where
    F: Fn(&mut S, &Deadline, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(handler)
}

fn typed<S, T, F>(handler: F) -> DeadlineHandlerFn<S>
where
    S: 'static,
    T: Any,
    F: Fn(&mut S, &T, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
{
    erase(move |state, deadline, lifecycle| match deadline.payload.downcast_ref::<T>() {
        Some(payload) => handler(state, payload, lifecycle),
        None => Err(Error::new(
            format!(
                "Deadline payload {} is not a {}",
                deadline.payload.type_name(),
                std::any::type_name::<T>()
            ),
            ErrorKind::Handler,
        )),
    })
}

/// Ordered deadline handler table of one saga type.
pub struct DeadlineHandlers<S> {
    registrations: Vec<Registration<S>>,
    next_order: usize,
}

impl<S> Default for DeadlineHandlers<S> {
    fn default() -> Self {
        Self {
            registrations: Vec::new(),
            next_order: 0,
        }
    }
}

impl<S> fmt::Debug for DeadlineHandlers<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.registrations
                    .iter()
                    .map(|r| (r.name.as_deref(), &r.matcher, r.specificity, r.order)),
            )
            .finish()
    }
}

impl<S: 'static> DeadlineHandlers<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle deadlines whose payload is a `T`.
    pub fn on<T, F>(self, handler: F) -> Self
    where
        T: Any,
        F: Fn(&mut S, &T, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register(None, PayloadMatcher::of::<T>(), Specificity::Exact, typed(handler))
    }

    /// Handle deadlines named `name` whose payload is a `T`.
    pub fn on_named<T, F>(self, name: impl Into<String>, handler: F) -> Self
    where
        T: Any,
        F: Fn(&mut S, &T, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register(
            Some(name.into()),
            PayloadMatcher::of::<T>(),
            Specificity::Exact,
            typed(handler),
        )
    }

    /// Handle deadlines whose payload satisfies `predicate`.
    ///
    /// `rank` orders families among themselves; lower wins.
    pub fn on_family<P, F>(self, label: impl Into<String>, rank: u8, predicate: P, handler: F) -> Self
    where
        P: Fn(&Payload) -> bool + Send + Sync + 'static,
        F: Fn(&mut S, &Deadline, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let matcher = PayloadMatcher::Family {
            label: label.into(),
            predicate: Arc::new(predicate),
        };
        self.register(None, matcher, Specificity::Family(rank), erase(handler))
    }

    /// Handle every deadline named `name`, whatever its payload.
    pub fn on_deadline_name<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut S, &Deadline, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register(
            Some(name.into()),
            PayloadMatcher::Any,
            Specificity::Any,
            erase(handler),
        )
    }

    /// Catch-all handler.
    pub fn on_any<F>(self, handler: F) -> Self
    where
        F: Fn(&mut S, &Deadline, &mut SagaLifecycle<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.register(None, PayloadMatcher::Any, Specificity::Any, erase(handler))
    }

    fn register(
        mut self,
        name: Option<String>,
        matcher: PayloadMatcher,
        specificity: Specificity,
        handler: DeadlineHandlerFn<S>,
    ) -> Self {
        self.registrations.push(Registration {
            name,
            matcher,
            specificity,
            order: self.next_order,
            handler,
        });
        self.next_order += 1;
        self.registrations
            .sort_by_key(|r| (r.name.is_none(), r.specificity, r.order));
        self
    }

    /// The handler that should run for `deadline`, if any.
    pub fn resolve(&self, deadline: &Deadline) -> Option<DeadlineHandlerFn<S>> {
        self.registrations
            .iter()
            .find(|registration| registration.matches(deadline))
            .map(|registration| Arc::clone(&registration.handler))
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
