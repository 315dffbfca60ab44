//! Named steps and groups resolved into a step list
//!
//! A [`StepCatalog`] holds steps registered under a name and groups that list
//! step or group names. Resolving a top-level group flattens it, depth first, into
//! the ordered step list a [`Sequence`] runs. Any step can be replaced by name
//! before resolving, which is how variants of a standard sequence are built.

use std::collections::HashMap;

use tracing::debug;

use crate::error::SequenceError;
use crate::executor::DispatcherRef;
use crate::monitor::RequestMonitor;
use crate::sequence::{Sequence, Step, StepContext};

enum Entry {
    Step(Box<dyn Step>),
    Group(Vec<String>),
}

/// Registry of named steps and groups
#[derive(Default)]
pub struct StepCatalog {
    entries: HashMap<String, Entry>,
}

impl StepCatalog {
    /// An empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `step` under `name`
    pub fn add_step<S, T>(&mut self, name: S, step: T) -> Result<&mut Self, SequenceError>
    where
        S: Into<String>,
        T: Step,
    {
        self.insert(name.into(), Entry::Step(Box::new(step)))
    }

    /// Register a group listing step or group names in execution order
    pub fn add_group<S, I, N>(&mut self, name: S, members: I) -> Result<&mut Self, SequenceError>
    where
        S: Into<String>,
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let members = members.into_iter().map(Into::into).collect();
        self.insert(name.into(), Entry::Group(members))
    }

    /// Replace the step registered under `name`
    pub fn override_step<S, T>(&mut self, name: S, step: T) -> Result<&mut Self, SequenceError>
    where
        S: Into<String>,
        T: Step,
    {
        let name = name.into();
        if !matches!(self.entries.get(&name), Some(Entry::Step(_))) {
            return Err(SequenceError::unknown(name));
        }
        self.entries.insert(name, Entry::Step(Box::new(step)));
        Ok(self)
    }

    /// Whether a step or group is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Step names `top` expands to, in execution order
    pub fn order(&self, top: &str) -> Result<Vec<String>, SequenceError> {
        let mut order = Vec::new();
        let mut path = Vec::new();
        self.expand(top, &mut path, &mut order)?;
        Ok(order)
    }

    /// Flatten `top` into its steps. A step reachable through two groups is an
    /// error, since each step instance runs at most once.
    pub fn resolve(mut self, top: &str) -> Result<Vec<Box<dyn Step>>, SequenceError> {
        let order = self.order(top)?;
        debug!(group = top, steps = order.len(), "Resolved step catalog");
        order
            .into_iter()
            .map(|name| match self.entries.remove(&name) {
                Some(Entry::Step(step)) => Ok(Box::new(Named { name, step }) as Box<dyn Step>),
                _ => Err(SequenceError::duplicate(name)),
            })
            .collect()
    }

    /// Resolve `top` and build a [`Sequence`] named after it
    pub fn into_sequence(self, dispatcher: &DispatcherRef, top: &str) -> Result<Sequence, SequenceError> {
        let steps = self.resolve(top)?;
        Ok(Sequence::new(dispatcher, steps).with_task_name(top))
    }

    fn insert(&mut self, name: String, entry: Entry) -> Result<&mut Self, SequenceError> {
        if self.entries.contains_key(&name) {
            return Err(SequenceError::duplicate(name));
        }
        self.entries.insert(name, entry);
        Ok(self)
    }

    fn expand(&self, name: &str, path: &mut Vec<String>, order: &mut Vec<String>) -> Result<(), SequenceError> {
        match self.entries.get(name) {
            None => Err(SequenceError::unknown(name)),
            Some(Entry::Step(_)) => {
                if order.iter().any(|existing| existing == name) {
                    return Err(SequenceError::duplicate(name));
                }
                order.push(name.to_string());
                Ok(())
            }
            Some(Entry::Group(members)) => {
                if path.iter().any(|open| open == name) {
                    return Err(SequenceError::cycle(name));
                }
                path.push(name.to_string());
                for member in members {
                    self.expand(member, path, order)?;
                }
                path.pop();
                Ok(())
            }
        }
    }
}

/// A catalog step reported under its registered name
struct Named {
    name: String,
    step: Box<dyn Step>,
}

impl Step for Named {
    fn execute(&mut self, ctx: &StepContext, rm: RequestMonitor) {
        self.step.execute(ctx, rm)
    }

    fn roll_back(&mut self, ctx: &StepContext, rm: RequestMonitor) {
        self.step.roll_back(ctx, rm)
    }

    fn ticks(&self) -> u64 {
        self.step.ticks()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
