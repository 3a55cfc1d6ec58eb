// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Assembly of a transaction's flat span list into a forest of timing nodes, and
//! the exclusive-time rule applied to every node.
//!
//! Parent/child edges come exclusively from explicit registrations recorded on the
//! spans. A span whose final parent link is unset is a root. When a child was
//! registered under several parents only its final parent keeps it; the other
//! registrations are skipped and counted as inconsistencies. Spans that cannot be
//! reached from any root (dangling or looping links in hand-built input) are
//! promoted to roots so that every span lands in exactly one tree.

use std::time::Duration;

use hashbrown::{HashMap, HashSet};

use crate::span::{Span, SpanId};

/// Immutable view of one span and the nodes registered beneath it.
#[derive(Debug, Clone)]
pub struct TimingNode<'a> {
    span: &'a Span,
    children: Vec<TimingNode<'a>>,
}

impl<'a> TimingNode<'a> {
    #[must_use]
    pub fn span(&self) -> &'a Span {
        self.span
    }

    #[must_use]
    pub fn children(&self) -> &[TimingNode<'a>] {
        &self.children
    }

    #[must_use]
    pub fn inclusive_duration(&self) -> Duration {
        self.span.duration_or_zero()
    }

    /// Inclusive time minus the summed inclusive time of the direct children,
    /// floored at zero. Children are neither clamped to this node's window nor
    /// deduplicated against each other.
    #[must_use]
    pub fn exclusive_duration(&self) -> Duration {
        let children = self
            .children
            .iter()
            .fold(Duration::ZERO, |acc, child| acc.saturating_add(child.inclusive_duration()));
        self.inclusive_duration().saturating_sub(children)
    }

    /// Pre-order walk over this node and all its descendants.
    pub fn iter(&self) -> Nodes<'_, 'a> {
        Nodes { stack: vec![self] }
    }
}

pub struct Nodes<'n, 'a> {
    stack: Vec<&'n TimingNode<'a>>,
}

impl<'n, 'a> Iterator for Nodes<'n, 'a> {
    type Item = &'n TimingNode<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Forest<'a> {
    pub roots: Vec<TimingNode<'a>>,
    /// Registrations skipped or spans promoted while assembling.
    pub inconsistencies: usize,
}

impl<'a> Forest<'a> {
    /// Node used when a single tree has to represent the transaction.
    #[must_use]
    pub fn primary_root(&self) -> Option<&TimingNode<'a>> {
        self.roots.first()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimingNode<'a>> {
        self.roots.iter().flat_map(|root| root.iter())
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.iter().count()
    }

    /// Sum of exclusive time across every node of every root.
    #[must_use]
    pub fn total_exclusive_duration(&self) -> Duration {
        self.iter()
            .fold(Duration::ZERO, |acc, node| acc.saturating_add(node.exclusive_duration()))
    }
}

#[must_use]
pub fn build_forest(spans: &[Span]) -> Forest<'_> {
    let position: HashMap<SpanId, usize> = spans
        .iter()
        .enumerate()
        .map(|(index, span)| (span.id(), index))
        .collect();
    let mut inconsistencies = 0;

    let parent_of: Vec<Option<usize>> = spans
        .iter()
        .map(|span| match span.parent() {
            Some(parent) if parent == span.id() => {
                inconsistencies += 1;
                None
            }
            Some(parent) => {
                let found = position.get(&parent).copied();
                if found.is_none() {
                    inconsistencies += 1;
                }
                found
            }
            None => None,
        })
        .collect();

    let child_lists: Vec<Vec<usize>> = spans
        .iter()
        .enumerate()
        .map(|(index, span)| {
            let mut seen = HashSet::with_capacity(span.children().len());
            let mut kept = Vec::with_capacity(span.children().len());
            for child in span.children() {
                match position.get(child) {
                    Some(&c) if parent_of[c] == Some(index) && seen.insert(c) => kept.push(c),
                    _ => inconsistencies += 1,
                }
            }
            kept
        })
        .collect();

    let natural_roots = (0..spans.len()).filter(|&i| parent_of[i].is_none());
    let mut visited = vec![false; spans.len()];
    let mut slots: Vec<Option<TimingNode<'_>>> = spans.iter().map(|_| None).collect();
    let mut roots = Vec::new();

    for (start, promoted) in natural_roots
        .map(|i| (i, false))
        .chain((0..spans.len()).map(|i| (i, true)))
    {
        if visited[start] {
            continue;
        }
        if promoted {
            inconsistencies += 1;
        }

        visited[start] = true;
        let mut order = Vec::new();
        let mut stack = vec![start];
        while let Some(index) = stack.pop() {
            order.push(index);
            for &child in &child_lists[index] {
                if !visited[child] {
                    visited[child] = true;
                    stack.push(child);
                }
            }
        }

        // Reverse pre-order visits every descendant before its ancestor.
        for &index in order.iter().rev() {
            let children = child_lists[index]
                .iter()
                .filter_map(|&child| slots[child].take())
                .collect();
            slots[index] = Some(TimingNode {
                span: &spans[index],
                children,
            });
        }
        if let Some(root) = slots[start].take() {
            roots.push(root);
        }
    }

    Forest {
        roots,
        inconsistencies,
    }
}
