//! Descriptor filters and plan construction.
//!
//! Filters only judge selectable units. A container stays in the plan when
//! at least one of its descendants does.

use super::probe::{Discovery, TestPlan};
use crate::config::FilterSettings;
use crate::model::{TestDescriptor, TestId};
use crate::selection::SelectionFilter;
use regex::Regex;
use std::collections::HashSet;

/// A predicate over selectable descriptors.
pub trait DescriptorFilter {
    fn includes(&self, descriptor: &TestDescriptor) -> bool;
}

impl DescriptorFilter for SelectionFilter<'_> {
    fn includes(&self, descriptor: &TestDescriptor) -> bool {
        let decision = self.decide(descriptor);
        tracing::trace!(id = %descriptor.id, ?decision, "selection");
        decision.is_included()
    }
}

/// Tag filter. Includes win over excludes when both are configured.
pub struct TagFilter {
    tags: HashSet<String>,
    exclude: bool,
}

impl TagFilter {
    pub fn from_settings(settings: &FilterSettings) -> Option<Self> {
        if !settings.include_tags.is_empty() {
            Some(Self { tags: settings.include_tags.clone(), exclude: false })
        } else if !settings.exclude_tags.is_empty() {
            Some(Self { tags: settings.exclude_tags.clone(), exclude: true })
        } else {
            None
        }
    }
}

impl DescriptorFilter for TagFilter {
    fn includes(&self, descriptor: &TestDescriptor) -> bool {
        let tagged = descriptor.tags.iter().any(|t| self.tags.contains(t));
        tagged != self.exclude
    }
}

/// Full-match pattern filter on the declaring class name.
pub struct PatternFilter {
    pattern: Regex,
    exclude: bool,
}

impl PatternFilter {
    pub fn from_settings(settings: &FilterSettings) -> Option<Self> {
        if let Some(pattern) = &settings.include_pattern {
            Some(Self { pattern: pattern.clone(), exclude: false })
        } else {
            settings
                .exclude_pattern
                .as_ref()
                .map(|pattern| Self { pattern: pattern.clone(), exclude: true })
        }
    }
}

impl DescriptorFilter for PatternFilter {
    fn includes(&self, descriptor: &TestDescriptor) -> bool {
        let matched = descriptor
            .declaring_class
            .as_deref()
            .is_some_and(|class| self.pattern.is_match(class));
        matched != self.exclude
    }
}

/// Engine filter on the `[engine:...]` segment of the id.
pub struct EngineFilter {
    engines: HashSet<String>,
    exclude: bool,
}

impl EngineFilter {
    pub fn from_settings(settings: &FilterSettings) -> Option<Self> {
        if !settings.include_engines.is_empty() {
            Some(Self { engines: settings.include_engines.clone(), exclude: false })
        } else if !settings.exclude_engines.is_empty() {
            Some(Self { engines: settings.exclude_engines.clone(), exclude: true })
        } else {
            None
        }
    }
}

impl DescriptorFilter for EngineFilter {
    fn includes(&self, descriptor: &TestDescriptor) -> bool {
        let matched = descriptor.engine().is_some_and(|e| self.engines.contains(e));
        matched != self.exclude
    }
}

/// Keeps only tests that are currently failing.
pub struct FailingOnlyFilter {
    failing: HashSet<TestId>,
}

impl FailingOnlyFilter {
    pub fn new(failing: HashSet<TestId>) -> Self {
        Self { failing }
    }
}

impl DescriptorFilter for FailingOnlyFilter {
    fn includes(&self, descriptor: &TestDescriptor) -> bool {
        self.failing.contains(&descriptor.id)
    }
}

/// Apply the filter chain to a discovery.
///
/// A selectable unit is kept when every filter includes it. Ancestors of
/// kept units are kept; containers with nothing kept below them are dropped.
pub fn build_plan(discovery: &Discovery, filters: &[&dyn DescriptorFilter]) -> TestPlan {
    let known: HashSet<&TestId> = discovery.descriptors.iter().map(|d| &d.id).collect();
    let mut keep: HashSet<TestId> = HashSet::new();

    for descriptor in &discovery.descriptors {
        if !descriptor.kind.is_selectable() {
            continue;
        }
        if !filters.iter().all(|f| f.includes(descriptor)) {
            continue;
        }
        keep.insert(descriptor.id.clone());

        let mut ancestor = descriptor.id.parent();
        while let Some(id) = ancestor {
            if known.contains(&id) && !keep.insert(id.clone()) {
                break;
            }
            ancestor = id.parent();
        }
    }

    TestPlan::new(
        discovery
            .descriptors
            .iter()
            .filter(|d| keep.contains(&d.id))
            .cloned()
            .collect(),
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::TestConfig;
    use crate::model::DescriptorKind;

    fn discovery() -> Discovery {
        let junit = TestId::root("engine", "junit");
        let spock = TestId::root("engine", "spock");
        let x = junit.child("class", "org.acme.XTest");
        let y = junit.child("class", "org.acme.YTest");
        Discovery::new(vec![
            TestDescriptor::new(junit.clone(), DescriptorKind::Container),
            TestDescriptor::new(x.clone(), DescriptorKind::Container).with_class("org.acme.XTest"),
            TestDescriptor::new(x.child("method", "fast"), DescriptorKind::Test)
                .with_class("org.acme.XTest")
                .with_tags(["fast"]),
            TestDescriptor::new(x.child("method", "slow"), DescriptorKind::Test)
                .with_class("org.acme.XTest")
                .with_tags(["slow"]),
            TestDescriptor::new(y.clone(), DescriptorKind::Container).with_class("org.acme.YTest"),
            TestDescriptor::new(y.child("method", "plain"), DescriptorKind::Test).with_class("org.acme.YTest"),
            TestDescriptor::new(spock.clone(), DescriptorKind::Container),
            TestDescriptor::new(spock.child("spec", "ZSpec"), DescriptorKind::ClassUnit).with_class("ZSpec"),
        ])
    }

    fn compiled(json: &str) -> FilterSettings {
        TestConfig::from_json(json).unwrap().compile().unwrap()
    }

    fn kept_units(plan: &TestPlan) -> Vec<String> {
        plan.descriptors()
            .iter()
            .filter(|d| d.kind.is_selectable())
            .map(|d| d.display_name.clone())
            .collect()
    }

    #[test]
    fn no_filters_keeps_everything() {
        let plan = build_plan(&discovery(), &[]);
        assert_eq!(plan.len(), 8);
        assert_eq!(plan.test_count(), 4);
    }

    #[test]
    fn include_tags_drop_untagged_and_empty_containers() {
        let settings = compiled(r#"{"include-tags": ["fast"], "exclude-tags": ["fast"]}"#);
        let tags = TagFilter::from_settings(&settings).unwrap();
        let plan = build_plan(&discovery(), &[&tags]);

        assert_eq!(kept_units(&plan), vec!["fast"]);
        // engine root and XTest remain, YTest and spock are gone
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn exclude_tags_keep_untagged() {
        let settings = compiled(r#"{"exclude-tags": ["slow"]}"#);
        let tags = TagFilter::from_settings(&settings).unwrap();
        let plan = build_plan(&discovery(), &[&tags]);
        assert_eq!(kept_units(&plan), vec!["fast", "plain", "ZSpec"]);
    }

    #[test]
    fn pattern_matches_whole_class_name() {
        let settings = compiled(r#"{"include-pattern": "org\\.acme\\.X.*"}"#);
        let pattern = PatternFilter::from_settings(&settings).unwrap();
        let plan = build_plan(&discovery(), &[&pattern]);
        assert_eq!(kept_units(&plan), vec!["fast", "slow"]);

        let settings = compiled(r#"{"exclude-pattern": "XTest"}"#);
        let pattern = PatternFilter::from_settings(&settings).unwrap();
        let plan = build_plan(&discovery(), &[&pattern]);
        // not a full match, nothing excluded
        assert_eq!(plan.test_count(), 4);
    }

    #[test]
    fn engine_filter_selects_by_root_segment() {
        let settings = compiled(r#"{"exclude-engines": ["junit"]}"#);
        let engines = EngineFilter::from_settings(&settings).unwrap();
        let plan = build_plan(&discovery(), &[&engines]);
        assert_eq!(kept_units(&plan), vec!["ZSpec"]);
    }

    #[test]
    fn failing_only_intersects() {
        let failing = HashSet::from([TestId::root("engine", "junit")
            .child("class", "org.acme.YTest")
            .child("method", "plain")]);
        let filter = FailingOnlyFilter::new(failing);
        let plan = build_plan(&discovery(), &[&filter]);
        assert_eq!(kept_units(&plan), vec!["plain"]);
    }

    #[test]
    fn filters_compose_as_intersection() {
        let settings = compiled(r#"{"exclude-tags": ["slow"], "include-engines": ["junit"]}"#);
        let tags = TagFilter::from_settings(&settings).unwrap();
        let engines = EngineFilter::from_settings(&settings).unwrap();
        let plan = build_plan(&discovery(), &[&tags, &engines]);
        assert_eq!(kept_units(&plan), vec!["fast", "plain"]);
    }

    #[test]
    fn unconfigured_filters_are_absent() {
        let settings = FilterSettings::default();
        assert!(TagFilter::from_settings(&settings).is_none());
        assert!(PatternFilter::from_settings(&settings).is_none());
        assert!(EngineFilter::from_settings(&settings).is_none());
    }
}
