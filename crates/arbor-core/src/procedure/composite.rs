//! Composite processors
//!
//! A composite decides how the children of a node are visited and how
//! their results combine. Parallel children run on forked visitors, each
//! owning the subtree it visits, and are absorbed back in child order.

use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::task::JoinSet;
use tracing::{debug, error};

use super::{NodeId, NodeState, ProcedureTree};
use crate::error::EngineError;
use crate::visitor::{visit, Visitor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Composite {
    /// In order, stop at the first failure
    #[default]
    Serial,
    /// Concurrently, succeed only if every child does
    Parallel,
    /// In order, stop at the first success
    Selector,
    /// Repeat the inner processor until it fails
    Loop(Box<Composite>),
    /// Run the inner processor once and always succeed
    NoFail(Box<Composite>),
}

impl Composite {
    pub fn symbol(&self) -> String {
        match self {
            Composite::Serial => "->".to_string(),
            Composite::Parallel => "||".to_string(),
            Composite::Selector => "?".to_string(),
            Composite::Loop(inner) => format!("Loop({})", inner.symbol()),
            Composite::NoFail(inner) => format!("NoFail({})", inner.symbol()),
        }
    }

    pub fn process<'a, V: Visitor>(
        &'a self,
        visitor: &'a mut V,
        tree: &'a mut ProcedureTree,
        parent: NodeId,
        children: Vec<NodeId>,
    ) -> BoxFuture<'a, Result<bool, EngineError>> {
        async move {
            match self {
                Composite::Serial => {
                    for child in children {
                        if !visit(visitor, tree, child).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Composite::Selector => {
                    for child in children {
                        if visit(visitor, tree, child).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Composite::Loop(inner) => loop {
                    if !inner.process(visitor, tree, parent, children.clone()).await? {
                        return Ok(false);
                    }
                    tokio::task::yield_now().await;
                },
                Composite::NoFail(inner) => {
                    inner.process(visitor, tree, parent, children).await?;
                    Ok(true)
                }
                Composite::Parallel => parallel(visitor, tree, parent, children).await,
            }
        }
        .boxed()
    }
}

impl fmt::Display for Composite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol())
    }
}

type BranchOutcome<V> = (usize, V, ProcedureTree, Result<bool, EngineError>);

async fn parallel<V: Visitor>(
    visitor: &mut V,
    tree: &mut ProcedureTree,
    parent: NodeId,
    children: Vec<NodeId>,
) -> Result<bool, EngineError> {
    let mut branches = Vec::with_capacity(children.len());
    for _ in &children {
        match visitor.fork() {
            Some(branch) => branches.push(branch),
            None => {
                debug!(parent = %parent, "visitor does not fork, visiting parallel children in order");
                let mut all = true;
                for child in children {
                    all &= visit(visitor, tree, child).await?;
                }
                return Ok(all);
            }
        }
    }

    let mut subtrees = Vec::with_capacity(children.len());
    for child in &children {
        match tree.split_off(*child) {
            Ok(subtree) => subtrees.push(subtree),
            Err(err) => {
                for subtree in subtrees {
                    tree.absorb(subtree);
                }
                return Err(err.into());
            }
        }
    }

    let flags: Vec<_> = branches.iter().map(|b| b.preempt_flag().clone()).collect();
    let mut set: JoinSet<BranchOutcome<V>> = JoinSet::new();
    for (index, ((child, mut branch), mut subtree)) in children
        .iter()
        .copied()
        .zip(branches)
        .zip(subtrees)
        .enumerate()
    {
        set.spawn(async move {
            let result = visit(&mut branch, &mut subtree, child).await;
            (index, branch, subtree, result)
        });
    }

    let parent_flag = visitor.preempt_flag().clone();
    let mut slots: Vec<Option<(V, ProcedureTree, Result<bool, EngineError>)>> =
        (0..children.len()).map(|_| None).collect();
    let mut forwarded = false;
    let mut join_error = None;
    loop {
        tokio::select! {
            joined = set.join_next() => match joined {
                Some(Ok((index, branch, subtree, result))) => {
                    slots[index] = Some((branch, subtree, result));
                }
                Some(Err(err)) => {
                    join_error.get_or_insert(EngineError::Join(err.to_string()));
                }
                None => break,
            },
            _ = parent_flag.requested(), if !forwarded => {
                forwarded = true;
                debug!(parent = %parent, "forwarding preemption to parallel branches");
                for flag in &flags {
                    flag.request();
                }
            }
        }
    }

    let lost: Vec<NodeId> = children
        .iter()
        .zip(&slots)
        .filter(|(_, slot)| slot.is_none())
        .map(|(child, _)| *child)
        .collect();
    if !lost.is_empty() {
        error!(parent = %parent, lost = ?lost, "parallel branches aborted, their subtrees are gone");
        tree.set_state(parent, NodeState::Error)?;
    }

    let mut all = true;
    let mut preempted = None;
    let mut failure = None;
    for (branch, subtree, result) in slots.into_iter().flatten() {
        tree.absorb(subtree);
        visitor.join(branch);
        match result {
            Ok(ok) => all &= ok,
            Err(EngineError::Preempted(label)) => {
                preempted.get_or_insert(label);
            }
            Err(err) => {
                failure.get_or_insert(err);
            }
        }
    }
    if let Some(err) = join_error {
        return Err(err);
    }
    if let Some(label) = preempted {
        return Err(EngineError::Preempted(label));
    }
    if let Some(err) = failure {
        return Err(err);
    }
    Ok(all)
}
