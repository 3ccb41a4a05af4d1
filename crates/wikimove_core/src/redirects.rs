use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::error::{Issue, IssueKind};
use crate::registry::{ActionKind, ReplacementRegistry, render_path};
use crate::title::Title;

/// One redirect hop. `to` may carry a section fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectEdge {
    pub from: Title,
    pub to: Title,
}

impl RedirectEdge {
    pub fn new(from: Title, to: Title) -> Self {
        Self {
            from: from.without_fragment(),
            to,
        }
    }
}

/// Single-hop redirect targets keyed by redirect page.
#[derive(Debug, Clone, Default)]
pub struct RedirectTable {
    edges: BTreeMap<Title, Title>,
}

impl RedirectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_edges(edges: impl IntoIterator<Item = RedirectEdge>) -> Self {
        let mut table = Self::new();
        for edge in edges {
            table.insert(edge);
        }
        table
    }

    pub fn insert(&mut self, edge: RedirectEdge) {
        self.edges.insert(edge.from, edge.to);
    }

    pub fn target(&self, title: &Title) -> Option<&Title> {
        self.edges.get(title)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&Title, &Title)> {
        self.edges.iter()
    }

    /// Redirects whose target is itself a redirect.
    pub fn double_redirects(&self) -> Vec<Title> {
        self.edges
            .iter()
            .filter(|(_, target)| self.edges.contains_key(*target))
            .map(|(from, _)| from.clone())
            .collect()
    }
}

/// Result of following one redirect chain to its end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    /// The page should point at `target` instead of `original`.
    Retarget {
        from: Title,
        original: Title,
        target: Title,
    },
    /// The stable target equals the current one-hop target.
    Unchanged { from: Title },
    Cycle { from: Title, members: Vec<Title> },
    FragmentConflict { from: Title, fragments: Vec<String> },
    NotARedirect { from: Title },
}

impl ChainOutcome {
    pub fn from(&self) -> &Title {
        match self {
            Self::Retarget { from, .. }
            | Self::Unchanged { from }
            | Self::Cycle { from, .. }
            | Self::FragmentConflict { from, .. }
            | Self::NotARedirect { from } => from,
        }
    }

    pub fn issue(&self) -> Option<Issue> {
        match self {
            Self::Cycle { from, members } => Some(Issue::new(
                IssueKind::CycleDetected,
                from.to_string(),
                render_path(members),
            )),
            Self::FragmentConflict { from, fragments } => Some(Issue::new(
                IssueKind::FragmentConflict,
                from.to_string(),
                format!("conflicting fragments: {}", fragments.join(", ")),
            )),
            _ => None,
        }
    }
}

/// Internal walk result shared by redirect chains and replacement chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChainWalk {
    Stable(Title),
    Cycle(Vec<Title>),
    FragmentConflict(Vec<String>),
}

/// Follows `first_hop` through `table` starting from `start`.
pub(crate) fn walk_chain(start: &Title, first_hop: &Title, table: &RedirectTable) -> ChainWalk {
    let mut visited = BTreeSet::from([start.clone()]);
    let mut path = vec![start.without_fragment()];
    let mut fragments: Vec<String> = Vec::new();
    let mut current = first_hop.clone();

    loop {
        if let Some(fragment) = current.fragment()
            && !fragments.iter().any(|seen| seen == fragment)
        {
            fragments.push(fragment.to_string());
        }
        if visited.contains(&current) {
            path.push(current.without_fragment());
            return ChainWalk::Cycle(path);
        }
        visited.insert(current.clone());
        path.push(current.without_fragment());
        match table.target(&current) {
            Some(next) => current = next.clone(),
            None => break,
        }
    }

    match fragments.len() {
        0 => ChainWalk::Stable(current.without_fragment()),
        1 => ChainWalk::Stable(current.with_fragment(fragments.first().map(String::as_str))),
        _ => ChainWalk::FragmentConflict(fragments),
    }
}

/// Follows the redirect at `from` to its stable target.
pub fn resolve_chain(from: &Title, table: &RedirectTable) -> ChainOutcome {
    let from = from.without_fragment();
    let Some(original) = table.target(&from) else {
        return ChainOutcome::NotARedirect { from };
    };

    match walk_chain(&from, original, table) {
        ChainWalk::Stable(target) => {
            if target.same_target(original) {
                ChainOutcome::Unchanged { from }
            } else {
                ChainOutcome::Retarget {
                    original: original.clone(),
                    from,
                    target,
                }
            }
        }
        ChainWalk::Cycle(members) => {
            warn!(redirect = %from, cycle = %render_path(&members), "redirect cycle detected");
            ChainOutcome::Cycle { from, members }
        }
        ChainWalk::FragmentConflict(fragments) => {
            warn!(redirect = %from, ?fragments, "redirect chain merges conflicting fragments");
            ChainOutcome::FragmentConflict { from, fragments }
        }
    }
}

pub fn resolve_chains<'a>(
    starts: impl IntoIterator<Item = &'a Title>,
    table: &RedirectTable,
) -> Vec<ChainOutcome> {
    starts
        .into_iter()
        .map(|start| resolve_chain(start, table))
        .collect()
}

/// Points every replacement whose destination is a redirect at the redirect's
/// stable target. Cycles and fragment conflicts turn the replacement into `Skip`.
///
/// A destination that redirects back to the replacement's own source is left
/// alone: that is the ordinary move over a redirect.
pub fn expand_destinations(registry: &mut ReplacementRegistry, table: &RedirectTable) -> Vec<Issue> {
    let mut issues = Vec::new();
    for entry in registry.values_mut().filter(|entry| !entry.is_skipped()) {
        let Some(next) = table.target(&entry.to) else {
            continue;
        };
        let walk = match walk_chain(&entry.to, next, table) {
            ChainWalk::Stable(target) => merge_fragment(target, entry.to.fragment()),
            other => other,
        };
        match walk {
            ChainWalk::Stable(target) => {
                if target == entry.from {
                    continue;
                }
                debug!(from = %entry.from, destination = %entry.to, %target, "expanded redirect destination");
                entry.to = target;
            }
            ChainWalk::Cycle(members) => {
                let path = render_path(&members);
                entry.set_outcome(ActionKind::Skip, format!("destination redirect cycle: {path}"));
                issues.push(Issue::new(IssueKind::CycleDetected, entry.from.to_string(), path));
            }
            ChainWalk::FragmentConflict(fragments) => {
                let detail = format!("conflicting fragments: {}", fragments.join(", "));
                entry.set_outcome(ActionKind::Skip, detail.clone());
                issues.push(Issue::new(IssueKind::FragmentConflict, entry.from.to_string(), detail));
            }
        }
    }
    issues
}

fn merge_fragment(target: Title, requested: Option<&str>) -> ChainWalk {
    match (requested, target.fragment()) {
        (None, _) => ChainWalk::Stable(target),
        (Some(requested), None) => ChainWalk::Stable(target.with_fragment(Some(requested))),
        (Some(requested), Some(found)) if requested == found => ChainWalk::Stable(target),
        (Some(requested), Some(found)) => {
            ChainWalk::FragmentConflict(vec![requested.to_string(), found.to_string()])
        }
    }
}
