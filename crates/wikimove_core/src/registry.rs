use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, Issue, IssueKind};
use crate::redirects::{ChainWalk, RedirectEdge, RedirectTable, walk_chain};
use crate::title::Title;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    /// Physically move the source page, then retarget references.
    Move,
    /// Leave the source page in place and only retarget references.
    EditOnly,
    Skip,
    /// Move through the job's merge handler instead of a plain page move.
    CustomMove,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Move => "move",
            Self::EditOnly => "edit-only",
            Self::Skip => "skip",
            Self::CustomMove => "custom-move",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "move" => Some(Self::Move),
            "edit-only" => Some(Self::EditOnly),
            "skip" => Some(Self::Skip),
            "custom-move" => Some(Self::CustomMove),
            _ => None,
        }
    }

    pub fn is_physical(self) -> bool {
        matches!(self, Self::Move | Self::CustomMove)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Replacement {
    pub from: Title,
    pub to: Title,
    /// Action asked for by the caller, kept apart from the resolved one for the audit report.
    pub requested: Option<ActionKind>,
    pub action: Option<ActionKind>,
    pub reason: Option<String>,
}

impl Replacement {
    pub fn new(from: Title, to: Title) -> Self {
        Self {
            from,
            to,
            requested: None,
            action: None,
            reason: None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.action == Some(ActionKind::Skip)
    }

    pub fn is_physical(&self) -> bool {
        self.action.is_some_and(ActionKind::is_physical)
    }

    pub fn set_outcome(&mut self, action: ActionKind, reason: impl Into<String>) {
        self.action = Some(action);
        self.reason = Some(reason.into());
    }
}

/// Title to title lookup driving the link rewrite visitor.
pub trait TitleMap {
    fn lookup(&self, title: &Title) -> Option<&Title>;
    fn sources(&self) -> Vec<&Title>;
}

impl TitleMap for BTreeMap<Title, Title> {
    fn lookup(&self, title: &Title) -> Option<&Title> {
        self.get(title)
    }

    fn sources(&self) -> Vec<&Title> {
        self.keys().collect()
    }
}

/// Source-unique collection of planned replacements, kept in insertion order.
#[derive(Debug, Clone, Default)]
pub struct ReplacementRegistry {
    entries: Vec<Replacement>,
    index: HashMap<Title, usize>,
}

impl ReplacementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `from -> to`. Returns `Ok(false)` when the identical mapping is
    /// already present and fails when `from` already maps elsewhere.
    pub fn add(
        &mut self,
        from: Title,
        to: Title,
        action: Option<ActionKind>,
        reason: Option<String>,
    ) -> Result<bool, ConfigurationError> {
        let from = from.without_fragment();
        if let Some(existing) = self.index.get(&from).map(|position| &self.entries[*position]) {
            if existing.to.same_target(&to) {
                return Ok(false);
            }
            return Err(ConfigurationError::DuplicateSource {
                from: from.to_string(),
                existing: existing.to.to_string(),
                requested: to.to_string(),
            });
        }

        let mut replacement = Replacement::new(from.clone(), to);
        replacement.requested = action;
        replacement.reason = reason;
        self.index.insert(from, self.entries.len());
        self.entries.push(replacement);
        Ok(true)
    }

    pub fn get(&self, title: &Title) -> Option<&Replacement> {
        self.index.get(title).map(|position| &self.entries[*position])
    }

    pub fn get_mut(&mut self, title: &Title) -> Option<&mut Replacement> {
        let position = *self.index.get(title)?;
        self.entries.get_mut(position)
    }

    pub fn values(&self) -> impl Iterator<Item = &Replacement> {
        self.entries.iter()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Replacement> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destinations claimed by more than one non-skipped source, claimants in insertion order.
    pub fn destination_collisions(&self) -> Vec<(Title, Vec<Title>)> {
        let mut claims: BTreeMap<Title, Vec<Title>> = BTreeMap::new();
        for replacement in self.entries.iter().filter(|entry| !entry.is_skipped()) {
            claims
                .entry(replacement.to.without_fragment())
                .or_default()
                .push(replacement.from.clone());
        }
        claims
            .into_iter()
            .filter(|(_, sources)| sources.len() > 1)
            .collect()
    }

    /// Closes the mapping so that no destination is itself a mapped source.
    ///
    /// Cycles become `Skip`. A physical move whose destination is itself moved
    /// away is demoted to `EditOnly`: its references follow the chain but the
    /// page stays where it is.
    pub fn flatten_chains(&mut self) -> Vec<Issue> {
        let table = RedirectTable::from_edges(
            self.entries
                .iter()
                .filter(|entry| !entry.is_skipped())
                .map(|entry| RedirectEdge::new(entry.from.clone(), entry.to.clone())),
        );

        let mut issues = Vec::new();
        for entry in self.entries.iter_mut().filter(|entry| !entry.is_skipped()) {
            if table.target(&entry.to).is_none() {
                continue;
            }
            match walk_chain(&entry.from, &entry.to, &table) {
                ChainWalk::Stable(target) => {
                    if entry.is_physical() {
                        entry.set_outcome(
                            ActionKind::EditOnly,
                            format!(
                                "destination {} is itself moved to {}; references retargeted only",
                                entry.to, target
                            ),
                        );
                    }
                    entry.to = target;
                }
                ChainWalk::Cycle(members) => {
                    let path = render_path(&members);
                    entry.set_outcome(ActionKind::Skip, format!("replacement cycle: {path}"));
                    issues.push(Issue::new(
                        IssueKind::CycleDetected,
                        entry.from.to_string(),
                        path,
                    ));
                }
                ChainWalk::FragmentConflict(fragments) => {
                    let detail = format!("conflicting fragments: {}", fragments.join(", "));
                    entry.set_outcome(ActionKind::Skip, detail.clone());
                    issues.push(Issue::new(
                        IssueKind::FragmentConflict,
                        entry.from.to_string(),
                        detail,
                    ));
                }
            }
        }
        issues
    }
}

impl TitleMap for ReplacementRegistry {
    fn lookup(&self, title: &Title) -> Option<&Title> {
        self.get(title)
            .filter(|entry| !entry.is_skipped())
            .map(|entry| &entry.to)
    }

    fn sources(&self) -> Vec<&Title> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_skipped())
            .map(|entry| &entry.from)
            .collect()
    }
}

pub(crate) fn render_path(members: &[Title]) -> String {
    members
        .iter()
        .map(Title::full_name)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::{ActionKind, ReplacementRegistry, TitleMap};
    use crate::error::{ConfigurationError, IssueKind};
    use crate::title::{CaseRule, NamespaceInfo, NamespaceTable, Title};

    fn table() -> NamespaceTable {
        let mut table = NamespaceTable::standard();
        table.insert(NamespaceInfo::new(3000, "Old"));
        table.insert(NamespaceInfo::new(3002, "New"));
        table.insert(NamespaceInfo::new(3004, "Slang").with_case(CaseRule::CaseInsensitive));
        table
    }

    fn title(text: &str) -> Title {
        Title::parse(text, &table()).expect("title")
    }

    #[test]
    fn duplicate_sources_are_detected() {
        let mut registry = ReplacementRegistry::new();
        assert!(
            registry
                .add(title("Old:Foo"), title("New:Foo"), None, None)
                .expect("first add")
        );
        assert!(
            !registry
                .add(title("Old:foo"), title("New:Foo"), None, None)
                .expect("same mapping")
        );
        let error = registry
            .add(title("Old:Foo"), title("New:Bar"), None, None)
            .expect_err("conflicting mapping");
        assert!(matches!(error, ConfigurationError::DuplicateSource { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn case_insensitive_namespace_lookups() {
        let mut registry = ReplacementRegistry::new();
        registry
            .add(title("Slang:LOL"), title("Slang:Laughing"), None, None)
            .expect("add");
        assert!(registry.get(&title("Slang:lol")).is_some());
        assert!(registry.get(&title("lol")).is_none());
        let error = registry
            .add(title("Slang:lol"), title("Slang:Other"), None, None)
            .expect_err("duplicate after folding");
        assert!(matches!(error, ConfigurationError::DuplicateSource { .. }));
    }

    #[test]
    fn values_keep_insertion_order_and_requested_action() {
        let mut registry = ReplacementRegistry::new();
        registry
            .add(title("Zeta"), title("Omega"), Some(ActionKind::CustomMove), None)
            .expect("add");
        registry
            .add(title("Alpha"), title("Beta"), None, Some("rename".to_string()))
            .expect("add");
        let sources: Vec<String> = registry.values().map(|entry| entry.from.full_name()).collect();
        assert_eq!(sources, vec!["Zeta", "Alpha"]);
        let zeta = registry.get(&title("Zeta")).expect("zeta");
        assert_eq!(zeta.requested, Some(ActionKind::CustomMove));
        assert_eq!(zeta.action, None);
    }

    #[test]
    fn destination_collisions_list_all_claimants() {
        let mut registry = ReplacementRegistry::new();
        registry.add(title("A"), title("Target"), None, None).expect("add");
        registry.add(title("B"), title("Target#Section"), None, None).expect("add");
        registry.add(title("C"), title("Other"), None, None).expect("add");
        let collisions = registry.destination_collisions();
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].0.full_name(), "Target");
        assert_eq!(collisions[0].1.len(), 2);
    }

    #[test]
    fn flatten_closes_chains_and_reports_cycles() {
        let mut registry = ReplacementRegistry::new();
        registry.add(title("A"), title("B"), None, None).expect("add");
        registry.add(title("B"), title("C"), None, None).expect("add");
        registry.add(title("X"), title("Y"), None, None).expect("add");
        registry.add(title("Y"), title("X"), None, None).expect("add");
        if let Some(entry) = registry.get_mut(&title("A")) {
            entry.set_outcome(ActionKind::Move, "plain move");
        }

        let issues = registry.flatten_chains();

        let a = registry.get(&title("A")).expect("a");
        assert_eq!(a.to.full_name(), "C");
        assert_eq!(a.action, Some(ActionKind::EditOnly));
        assert_eq!(registry.lookup(&title("B")).map(Title::full_name), Some("C".to_string()));
        assert!(registry.get(&title("X")).expect("x").is_skipped());
        assert!(registry.get(&title("Y")).expect("y").is_skipped());
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|issue| issue.kind == IssueKind::CycleDetected));
        assert!(registry.lookup(&title("X")).is_none());
    }

    #[test]
    fn flatten_carries_fragment_and_detects_conflicts() {
        let mut registry = ReplacementRegistry::new();
        registry.add(title("A"), title("B#One"), None, None).expect("add");
        registry.add(title("B"), title("C"), None, None).expect("add");
        registry.add(title("P"), title("Q#One"), None, None).expect("add");
        registry.add(title("Q"), title("R#Two"), None, None).expect("add");

        let issues = registry.flatten_chains();

        assert_eq!(registry.get(&title("A")).expect("a").to.to_string(), "C#One");
        assert!(registry.get(&title("P")).expect("p").is_skipped());
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::FragmentConflict);
    }
}
