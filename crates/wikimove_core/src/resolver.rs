use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::registry::{ActionKind, Replacement, ReplacementRegistry};
use crate::site::PageInfo;
use crate::title::Title;

pub const PENDING_DELETION_REASON: &str = "destination pending deletion, needs manual resolution";

/// What the resolver needs to know about one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageStatus {
    pub exists: bool,
    pub is_redirect: bool,
    pub is_disambiguation: bool,
    pub pending_deletion: bool,
}

impl PageStatus {
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn from_info(info: &PageInfo, rules: &StatusRules) -> Self {
        let in_any = |categories: &[Title]| {
            info.categories
                .iter()
                .any(|category| categories.contains(category))
        };
        Self {
            exists: info.exists,
            is_redirect: info.is_redirect(),
            is_disambiguation: info.disambiguation || in_any(&rules.disambiguation_categories),
            pending_deletion: in_any(&rules.deletion_categories),
        }
    }
}

/// Site-specific categories that mark disambiguation pages and deletion requests.
#[derive(Debug, Clone, Default)]
pub struct StatusRules {
    pub deletion_categories: Vec<Title>,
    pub disambiguation_categories: Vec<Title>,
}

/// Per-job classification hook, consulted before the default decision table.
pub trait ConflictPolicy {
    fn classify(
        &self,
        replacement: &Replacement,
        source: &PageStatus,
        destination: &PageStatus,
    ) -> Option<(ActionKind, String)>;
}

/// Leaves every replacement to the default table.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl ConflictPolicy for DefaultPolicy {
    fn classify(&self, _: &Replacement, _: &PageStatus, _: &PageStatus) -> Option<(ActionKind, String)> {
        None
    }
}

/// Forces one action for every replacement the table would otherwise move.
#[derive(Debug, Clone)]
pub struct ForceAction {
    pub action: ActionKind,
    pub reason: String,
}

impl ConflictPolicy for ForceAction {
    fn classify(
        &self,
        _: &Replacement,
        source: &PageStatus,
        _: &PageStatus,
    ) -> Option<(ActionKind, String)> {
        source
            .exists
            .then(|| (self.action, self.reason.clone()))
    }
}

pub struct ConflictResolver<'a> {
    policy: &'a dyn ConflictPolicy,
    merge_handler: bool,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(policy: &'a dyn ConflictPolicy) -> Self {
        Self {
            policy,
            merge_handler: false,
        }
    }

    /// Same-name moves across namespaces become `CustomMove`.
    pub fn with_merge_handler(mut self, enabled: bool) -> Self {
        self.merge_handler = enabled;
        self
    }

    /// Assigns an action and a reason to every replacement in insertion order.
    /// Titles absent from `statuses` are treated as missing pages.
    pub fn resolve(&self, registry: &mut ReplacementRegistry, statuses: &BTreeMap<Title, PageStatus>) {
        let mut claimed: HashMap<Title, Title> = HashMap::new();
        let missing = PageStatus::missing();

        for entry in registry.values_mut() {
            let source = statuses.get(&entry.from).unwrap_or(&missing);
            let destination = statuses.get(&entry.to).unwrap_or(&missing);
            let (action, reason) = self.classify(entry, source, destination, &claimed);
            if action.is_physical() {
                claimed.insert(entry.to.without_fragment(), entry.from.clone());
            }
            debug!(from = %entry.from, to = %entry.to, action = action.as_str(), %reason, "resolved replacement");
            entry.set_outcome(action, reason);
        }
    }

    fn classify(
        &self,
        entry: &Replacement,
        source: &PageStatus,
        destination: &PageStatus,
        claimed: &HashMap<Title, Title>,
    ) -> (ActionKind, String) {
        if destination.pending_deletion {
            return (ActionKind::Skip, PENDING_DELETION_REASON.to_string());
        }

        let overridden = entry
            .requested
            .filter(|action| *action != ActionKind::Move)
            .map(|requested| {
                let reason = entry
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("{} requested by job", requested.as_str()));
                (requested, reason)
            })
            .or_else(|| self.policy.classify(entry, source, destination));
        if let Some((action, reason)) = overridden {
            if !action.is_physical() {
                return (action, reason);
            }
            return physical_conflict(entry, claimed).unwrap_or((action, reason));
        }

        if entry.from == entry.to {
            return (
                ActionKind::Skip,
                "source and destination are the same page".to_string(),
            );
        }
        if !source.exists {
            return (
                ActionKind::EditOnly,
                "source page does not exist; references retargeted only".to_string(),
            );
        }
        if let Some(conflict) = physical_conflict(entry, claimed) {
            return conflict;
        }
        if source.is_redirect {
            return (
                ActionKind::EditOnly,
                "source is a redirect; only its own text is updated".to_string(),
            );
        }
        if source.is_disambiguation {
            return (
                ActionKind::EditOnly,
                "source is a disambiguation page; only its own text is updated".to_string(),
            );
        }
        if destination.exists && destination.is_redirect {
            return (
                ActionKind::EditOnly,
                "destination exists and is a redirect; references retargeted only".to_string(),
            );
        }
        if destination.exists && destination.is_disambiguation {
            return (
                ActionKind::EditOnly,
                "destination exists and is a disambiguation page; references retargeted only"
                    .to_string(),
            );
        }

        let cross_namespace_merge = entry.from.namespace() != entry.to.namespace()
            && entry.from.page_name() == entry.to.page_name();
        if self.merge_handler && cross_namespace_merge {
            return (
                ActionKind::CustomMove,
                "same page name merged into another namespace".to_string(),
            );
        }
        if destination.exists {
            return (
                ActionKind::Move,
                "destination exists as a regular page; the site may refuse the move".to_string(),
            );
        }
        (ActionKind::Move, "destination is free".to_string())
    }
}

/// Reasons a physical move cannot go ahead whatever the job asked for.
fn physical_conflict(
    entry: &Replacement,
    claimed: &HashMap<Title, Title>,
) -> Option<(ActionKind, String)> {
    if entry.from == entry.to {
        return Some((
            ActionKind::Skip,
            "source and destination are the same page".to_string(),
        ));
    }
    claimed.get(&entry.to).map(|owner| {
        (
            ActionKind::Skip,
            format!("destination already claimed by the move of {owner}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{
        ConflictResolver, DefaultPolicy, ForceAction, PENDING_DELETION_REASON, PageStatus,
        StatusRules,
    };
    use crate::registry::{ActionKind, ReplacementRegistry};
    use crate::site::PageInfo;
    use crate::title::{NamespaceInfo, NamespaceTable, Title};

    fn table() -> NamespaceTable {
        let mut table = NamespaceTable::standard();
        table.insert(NamespaceInfo::new(3000, "Old"));
        table.insert(NamespaceInfo::new(3002, "New"));
        table
    }

    fn title(text: &str) -> Title {
        Title::parse(text, &table()).expect("title")
    }

    fn existing() -> PageStatus {
        PageStatus {
            exists: true,
            ..PageStatus::default()
        }
    }

    fn registry(pairs: &[(&str, &str)]) -> ReplacementRegistry {
        let mut registry = ReplacementRegistry::new();
        for (from, to) in pairs {
            registry.add(title(from), title(to), None, None).expect("add");
        }
        registry
    }

    fn outcome(registry: &ReplacementRegistry, from: &str) -> (ActionKind, String) {
        let entry = registry.get(&title(from)).expect("entry");
        (
            entry.action.expect("resolved"),
            entry.reason.clone().unwrap_or_default(),
        )
    }

    #[test]
    fn free_destination_moves_and_redirect_destination_edits() {
        let mut registry = registry(&[("Old:Foo", "New:Foo"), ("Old:Bar", "New:Bar")]);
        let mut statuses = BTreeMap::new();
        statuses.insert(title("Old:Foo"), existing());
        statuses.insert(title("Old:Bar"), existing());
        statuses.insert(
            title("New:Bar"),
            PageStatus {
                exists: true,
                is_redirect: true,
                ..PageStatus::default()
            },
        );

        ConflictResolver::new(&DefaultPolicy).resolve(&mut registry, &statuses);

        assert_eq!(outcome(&registry, "Old:Foo").0, ActionKind::Move);
        let (action, reason) = outcome(&registry, "Old:Bar");
        assert_eq!(action, ActionKind::EditOnly);
        assert!(reason.contains("redirect"));
    }

    #[test]
    fn pending_deletion_wins_over_overrides() {
        let mut registry = ReplacementRegistry::new();
        registry
            .add(title("A"), title("B"), Some(ActionKind::CustomMove), None)
            .expect("add");
        let mut statuses = BTreeMap::new();
        statuses.insert(title("A"), existing());
        statuses.insert(
            title("B"),
            PageStatus {
                exists: true,
                pending_deletion: true,
                ..PageStatus::default()
            },
        );

        ConflictResolver::new(&DefaultPolicy).resolve(&mut registry, &statuses);

        assert_eq!(
            outcome(&registry, "A"),
            (ActionKind::Skip, PENDING_DELETION_REASON.to_string())
        );
    }

    #[test]
    fn source_redirect_and_missing_source_are_edit_only() {
        let mut registry = registry(&[("Redirected", "Target"), ("Ghost", "Elsewhere")]);
        let mut statuses = BTreeMap::new();
        statuses.insert(
            title("Redirected"),
            PageStatus {
                exists: true,
                is_redirect: true,
                ..PageStatus::default()
            },
        );

        ConflictResolver::new(&DefaultPolicy).resolve(&mut registry, &statuses);

        assert_eq!(outcome(&registry, "Redirected").0, ActionKind::EditOnly);
        let (action, reason) = outcome(&registry, "Ghost");
        assert_eq!(action, ActionKind::EditOnly);
        assert!(reason.contains("does not exist"));
    }

    #[test]
    fn second_claimant_of_a_destination_is_skipped() {
        let mut registry = registry(&[("A", "Target"), ("B", "Target")]);
        let mut statuses = BTreeMap::new();
        statuses.insert(title("A"), existing());
        statuses.insert(title("B"), existing());

        ConflictResolver::new(&DefaultPolicy).resolve(&mut registry, &statuses);

        assert_eq!(outcome(&registry, "A").0, ActionKind::Move);
        let (action, reason) = outcome(&registry, "B");
        assert_eq!(action, ActionKind::Skip);
        assert!(reason.contains("claimed"));
    }

    #[test]
    fn merge_handler_turns_namespace_merges_into_custom_moves() {
        let mut registry = registry(&[("Old:Foo", "New:Foo"), ("Old:Bar", "New:Baz")]);
        let mut statuses = BTreeMap::new();
        statuses.insert(title("Old:Foo"), existing());
        statuses.insert(title("Old:Bar"), existing());

        ConflictResolver::new(&DefaultPolicy)
            .with_merge_handler(true)
            .resolve(&mut registry, &statuses);

        assert_eq!(outcome(&registry, "Old:Foo").0, ActionKind::CustomMove);
        assert_eq!(outcome(&registry, "Old:Bar").0, ActionKind::Move);
    }

    #[test]
    fn job_policy_and_per_entry_requests_override_the_table() {
        let mut registry = ReplacementRegistry::new();
        registry.add(title("A"), title("B"), None, None).expect("add");
        registry
            .add(
                title("C"),
                title("D"),
                Some(ActionKind::Skip),
                Some("left for later".to_string()),
            )
            .expect("add");
        let mut statuses = BTreeMap::new();
        statuses.insert(title("A"), existing());
        statuses.insert(title("C"), existing());
        let policy = ForceAction {
            action: ActionKind::CustomMove,
            reason: "always merge".to_string(),
        };

        ConflictResolver::new(&policy).resolve(&mut registry, &statuses);

        assert_eq!(
            outcome(&registry, "A"),
            (ActionKind::CustomMove, "always merge".to_string())
        );
        assert_eq!(
            outcome(&registry, "C"),
            (ActionKind::Skip, "left for later".to_string())
        );
    }

    #[test]
    fn overrides_do_not_move_two_pages_onto_one_destination() {
        let mut registry = registry(&[("A", "Target"), ("B", "Target")]);
        let mut statuses = BTreeMap::new();
        statuses.insert(title("A"), existing());
        statuses.insert(title("B"), existing());
        let policy = ForceAction {
            action: ActionKind::CustomMove,
            reason: "always merge".to_string(),
        };

        ConflictResolver::new(&policy).resolve(&mut registry, &statuses);

        assert_eq!(outcome(&registry, "A").0, ActionKind::CustomMove);
        let (action, reason) = outcome(&registry, "B");
        assert_eq!(action, ActionKind::Skip);
        assert!(reason.contains("claimed by the move of A"));
    }

    #[test]
    fn requested_move_onto_itself_is_skipped() {
        let mut registry = ReplacementRegistry::new();
        registry
            .add(title("Same"), title("Same#Part"), Some(ActionKind::CustomMove), None)
            .expect("add");
        let mut statuses = BTreeMap::new();
        statuses.insert(title("Same"), existing());

        ConflictResolver::new(&DefaultPolicy).resolve(&mut registry, &statuses);

        let (action, reason) = outcome(&registry, "Same");
        assert_eq!(action, ActionKind::Skip);
        assert!(reason.contains("same page"));
    }

    #[test]
    fn status_reads_configured_categories() {
        let rules = StatusRules {
            deletion_categories: vec![title("Category:Candidates for deletion")],
            disambiguation_categories: vec![title("Category:Disambiguation pages")],
        };
        let info = PageInfo {
            title: title("Mercury"),
            exists: true,
            redirect_target: None,
            disambiguation: false,
            categories: vec![title("Category:Disambiguation_pages")],
        };
        let status = PageStatus::from_info(&info, &rules);
        assert!(status.is_disambiguation);
        assert!(!status.pending_deletion);
        assert!(!status.is_redirect);
    }
}
