//! Storage boundary. Profiles and events live outside the engine; the
//! in-memory store backs tests and the CLI.

use audience_core::{AudienceResult, Event, Profile};
use audience_segmentation::TimeWindow;
use dashmap::DashMap;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub profile_id: String,
    pub event_name: Option<String>,
    pub window: Option<TimeWindow>,
}

impl EventQuery {
    /// Every event for one profile.
    pub fn for_profile(profile_id: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            ..Default::default()
        }
    }

    pub fn named(mut self, event_name: impl Into<String>) -> Self {
        self.event_name = Some(event_name.into());
        self
    }

    pub fn within(mut self, window: TimeWindow) -> Self {
        self.window = Some(window);
        self
    }

    fn accepts(&self, event: &Event) -> bool {
        event.profile_id == self.profile_id
            && self
                .event_name
                .as_deref()
                .map_or(true, |name| event.event_name == name)
            && self.window.map_or(true, |w| w.contains(event.timestamp))
    }
}

/// Read access to profiles and their events. Events come back in arrival
/// order.
pub trait EventStore: Send + Sync {
    fn profile(&self, project_id: &str, profile_id: &str) -> AudienceResult<Option<Profile>>;

    fn profiles(&self, project_id: &str) -> AudienceResult<Vec<Profile>>;

    fn events(&self, project_id: &str, query: &EventQuery) -> AudienceResult<Vec<Event>>;
}

#[derive(Debug, Default)]
struct ProjectData {
    profiles: BTreeMap<String, Profile>,
    events: BTreeMap<String, Vec<Event>>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    projects: DashMap<String, ProjectData>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a profile.
    pub fn upsert_profile(&self, project_id: &str, profile: Profile) {
        self.projects
            .entry(project_id.to_string())
            .or_default()
            .profiles
            .insert(profile.id.clone(), profile);
    }

    /// Append an event to its profile's history.
    pub fn append_event(&self, project_id: &str, event: Event) {
        self.projects
            .entry(project_id.to_string())
            .or_default()
            .events
            .entry(event.profile_id.clone())
            .or_default()
            .push(event);
    }

    pub fn profile_count(&self, project_id: &str) -> usize {
        self.projects
            .get(project_id)
            .map(|p| p.profiles.len())
            .unwrap_or(0)
    }

    pub fn event_count(&self, project_id: &str) -> usize {
        self.projects
            .get(project_id)
            .map(|p| p.events.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

impl EventStore for InMemoryStore {
    fn profile(&self, project_id: &str, profile_id: &str) -> AudienceResult<Option<Profile>> {
        Ok(self
            .projects
            .get(project_id)
            .and_then(|p| p.profiles.get(profile_id).cloned()))
    }

    fn profiles(&self, project_id: &str) -> AudienceResult<Vec<Profile>> {
        Ok(self
            .projects
            .get(project_id)
            .map(|p| p.profiles.values().cloned().collect())
            .unwrap_or_default())
    }

    fn events(&self, project_id: &str, query: &EventQuery) -> AudienceResult<Vec<Event>> {
        let Some(project) = self.projects.get(project_id) else {
            return Ok(Vec::new());
        };
        Ok(project
            .events
            .get(&query.profile_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| query.accepts(e))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_events_keep_arrival_order_and_filter() {
        let store = InMemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        store.append_event("p", Event::new("u1", "view", t0 + Duration::hours(2)));
        store.append_event("p", Event::new("u1", "purchase", t0));
        store.append_event("p", Event::new("u1", "view", t0 - Duration::days(5)));
        store.append_event("p", Event::new("u2", "view", t0));

        let all = store.events("p", &EventQuery::for_profile("u1")).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].event_name, "view");
        assert_eq!(all[1].event_name, "purchase");

        let window = TimeWindow {
            from: t0 - Duration::days(1),
            to: t0 + Duration::days(1),
        };
        let views = store
            .events("p", &EventQuery::for_profile("u1").named("view").within(window))
            .unwrap();
        assert_eq!(views.len(), 1);
        assert!(store.events("other", &EventQuery::for_profile("u1")).unwrap().is_empty());
    }

    #[test]
    fn test_profiles_sorted_by_id() {
        let store = InMemoryStore::new();
        store.upsert_profile("p", Profile::new("b"));
        store.upsert_profile("p", Profile::new("a"));
        store.upsert_profile("p", Profile::new("a"));
        let ids: Vec<String> = store.profiles("p").unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert!(store.profile("p", "a").unwrap().is_some());
        assert!(store.profile("p", "zz").unwrap().is_none());
        assert_eq!(store.profile_count("p"), 2);
    }
}
