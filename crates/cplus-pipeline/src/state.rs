//! The activity/pathway graph threaded through the stages.
//!
//! Pathways are deduplicated by UUID: a pathway shared by several
//! activities is stored once and processed once. Activities refer to
//! their pathways by id. Each stage consumes the state and returns the
//! rewritten one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::PriorityLayerResolver;
use crate::types::{Activity, Pathway, PipelineError, PriorityWeightingLayer, non_empty};

/// An activity inside [`AnalysisState`].
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityState {
    /// Identifier.
    pub uuid: Uuid,
    /// Display name.
    pub name: String,
    /// Free-text description.
    pub description: String,
    /// Current raster path.
    pub path: Option<PathBuf>,
    /// Pathways composed into this activity, in order.
    pub pathway_ids: Vec<Uuid>,
    /// Per-activity exclusion masks.
    pub mask_paths: Vec<PathBuf>,
    /// Position in the final stack.
    pub style_pixel_value: i64,
}

impl ActivityState {
    /// The raster path, ignoring empty paths.
    #[must_use]
    pub fn layer_path(&self) -> Option<&Path> {
        non_empty(self.path.as_deref())
    }
}

/// Snapshot of every pathway and activity of a run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnalysisState {
    order: Vec<Uuid>,
    pathways: HashMap<Uuid, Pathway>,
    activities: Vec<ActivityState>,
}

impl AnalysisState {
    /// Build the state from the caller's activities, resolving every
    /// priority weighting layer through `resolver`.
    ///
    /// Layers the resolver does not know are dropped with a warning.
    #[must_use]
    pub fn new(activities: &[Activity], resolver: &dyn PriorityLayerResolver) -> Self {
        let mut state = Self::default();
        for activity in activities {
            let mut pathway_ids = Vec::with_capacity(activity.pathways.len());
            for pathway in &activity.pathways {
                if !state.pathways.contains_key(&pathway.uuid) {
                    let mut resolved = pathway.clone();
                    resolved.priority_layers = pathway
                        .priority_layers
                        .iter()
                        .filter_map(|layer| resolve_layer(layer, resolver, &pathway.name))
                        .collect();
                    state.order.push(pathway.uuid);
                    state.pathways.insert(pathway.uuid, resolved);
                }
                if !pathway_ids.contains(&pathway.uuid) {
                    pathway_ids.push(pathway.uuid);
                }
            }
            state.activities.push(ActivityState {
                uuid: activity.uuid,
                name: activity.name.clone(),
                description: activity.description.clone(),
                path: activity.path.clone(),
                pathway_ids,
                mask_paths: activity.mask_paths.clone(),
                style_pixel_value: activity.style_pixel_value,
            });
        }
        state
    }

    /// Pathway ids in first-seen order.
    #[must_use]
    pub fn pathway_ids(&self) -> &[Uuid] {
        &self.order
    }

    /// Distinct pathways in first-seen order.
    pub fn pathways(&self) -> impl Iterator<Item = &Pathway> {
        self.order.iter().filter_map(|id| self.pathways.get(id))
    }

    /// Look up a pathway.
    #[must_use]
    pub fn pathway(&self, id: &Uuid) -> Option<&Pathway> {
        self.pathways.get(id)
    }

    /// Apply `f` to every distinct pathway in order, stopping at the
    /// first error.
    ///
    /// # Errors
    ///
    /// The first error `f` returns.
    pub fn try_for_each_pathway<E>(
        &mut self,
        mut f: impl FnMut(&mut Pathway) -> Result<(), E>,
    ) -> Result<(), E> {
        for id in &self.order {
            if let Some(pathway) = self.pathways.get_mut(id) {
                f(pathway)?;
            }
        }
        Ok(())
    }

    /// Whether any activity has pathways.
    #[must_use]
    pub fn has_pathways(&self) -> bool {
        !self.order.is_empty()
    }

    /// The activities.
    #[must_use]
    pub fn activities(&self) -> &[ActivityState] {
        &self.activities
    }

    /// The activities, for rewriting.
    pub fn activities_mut(&mut self) -> &mut [ActivityState] {
        &mut self.activities
    }

    /// Pathways of one activity, in order.
    pub fn activity_pathways<'a>(
        &'a self,
        activity: &'a ActivityState,
    ) -> impl Iterator<Item = &'a Pathway> + 'a {
        activity
            .pathway_ids
            .iter()
            .filter_map(|id| self.pathways.get(id))
    }

    /// Sort activities by stack position and renumber them `1..=N`.
    pub fn restack(&mut self) {
        self.activities.sort_by_key(|a| a.style_pixel_value);
        for (position, activity) in (1_i64..).zip(self.activities.iter_mut()) {
            activity.style_pixel_value = position;
        }
    }

    /// Check that there is at least one activity and that every
    /// activity has a layer or pathways.
    ///
    /// # Errors
    ///
    /// [`PipelineError::NoActivities`] or [`PipelineError::MissingLayers`].
    pub fn require_layers(&self) -> Result<(), PipelineError> {
        if self.activities.is_empty() {
            return Err(PipelineError::NoActivities);
        }
        match self
            .activities
            .iter()
            .find(|a| a.pathway_ids.is_empty() && a.layer_path().is_none())
        {
            Some(activity) => Err(PipelineError::MissingLayers {
                activity: activity.name.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Rebuild caller-facing activities, with pathways in their current
    /// state.
    #[must_use]
    pub fn to_activities(&self) -> Vec<Activity> {
        self.activities
            .iter()
            .map(|a| Activity {
                uuid: a.uuid,
                name: a.name.clone(),
                description: a.description.clone(),
                path: a.path.clone(),
                pathways: self.activity_pathways(a).cloned().collect(),
                mask_paths: a.mask_paths.clone(),
                style_pixel_value: a.style_pixel_value,
            })
            .collect()
    }
}

fn resolve_layer(
    layer: &PriorityWeightingLayer,
    resolver: &dyn PriorityLayerResolver,
    pathway: &str,
) -> Option<PriorityWeightingLayer> {
    let Some(record) = resolver.priority_layer(&layer.uuid) else {
        tracing::warn!(
            pathway,
            layer = %layer.uuid,
            "priority weighting layer not found in settings, skipping it"
        );
        return None;
    };
    Some(PriorityWeightingLayer {
        uuid: layer.uuid,
        name: if layer.name.is_empty() {
            record.name
        } else {
            layer.name.clone()
        },
        path: Some(record.path),
        groups: record.groups,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{MapSettings, PriorityLayerRecord};
    use crate::types::PriorityGroup;

    fn pathway(n: u128, name: &str, pwls: Vec<PriorityWeightingLayer>) -> Pathway {
        Pathway {
            uuid: Uuid::from_u128(n),
            name: name.to_string(),
            path: PathBuf::from(format!("/data/{name}.tif")),
            priority_layers: pwls,
            carbon_paths: vec![],
        }
    }

    fn activity(n: u128, name: &str, pathways: Vec<Pathway>, position: i64) -> Activity {
        Activity {
            uuid: Uuid::from_u128(n),
            name: name.to_string(),
            description: String::new(),
            path: None,
            pathways,
            mask_paths: vec![],
            style_pixel_value: position,
        }
    }

    #[test]
    fn shared_pathways_are_stored_once() {
        let shared = pathway(1, "grass", vec![]);
        let activities = [
            activity(10, "A", vec![shared.clone(), pathway(2, "tree", vec![])], 0),
            activity(11, "B", vec![shared], 0),
        ];
        let state = AnalysisState::new(&activities, &MapSettings::new());
        assert_eq!(state.pathway_ids(), &[Uuid::from_u128(1), Uuid::from_u128(2)]);
        assert_eq!(state.activities()[1].pathway_ids, vec![Uuid::from_u128(1)]);
        assert_eq!(state.to_activities()[0].pathways.len(), 2);
    }

    #[test]
    fn priority_layers_resolve_or_drop() {
        let known = Uuid::from_u128(100);
        let resolver = MapSettings::new().with_priority_layer(PriorityLayerRecord {
            uuid: known,
            name: "Biodiversity".to_string(),
            path: PathBuf::from("/pwl/bio.tif"),
            groups: vec![PriorityGroup {
                name: "Biodiversity".to_string(),
                value: 4.0,
            }],
        });
        let pwls = vec![
            PriorityWeightingLayer {
                uuid: known,
                name: String::new(),
                path: None,
                groups: vec![],
            },
            PriorityWeightingLayer {
                uuid: Uuid::from_u128(101),
                name: "Unknown".to_string(),
                path: None,
                groups: vec![],
            },
        ];
        let activities = [activity(10, "A", vec![pathway(1, "grass", pwls)], 0)];
        let state = AnalysisState::new(&activities, &resolver);

        let layers = &state.pathway(&Uuid::from_u128(1)).unwrap().priority_layers;
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].name, "Biodiversity");
        assert_eq!(layers[0].path.as_deref(), Some(Path::new("/pwl/bio.tif")));
        assert_eq!(layers[0].groups.len(), 1);
    }

    #[test]
    fn require_layers_detects_empty_activities() {
        let empty = AnalysisState::new(&[], &MapSettings::new());
        assert!(matches!(empty.require_layers(), Err(PipelineError::NoActivities)));

        let activities = [
            activity(10, "Fine", vec![pathway(1, "grass", vec![])], 0),
            activity(11, "Bare", vec![], 0),
        ];
        let state = AnalysisState::new(&activities, &MapSettings::new());
        assert!(matches!(
            state.require_layers(),
            Err(PipelineError::MissingLayers { activity }) if activity == "Bare"
        ));
    }

    #[test]
    fn restack_sorts_and_renumbers_densely() {
        let activities = [
            activity(10, "C", vec![pathway(1, "a", vec![])], 30),
            activity(11, "A", vec![pathway(2, "b", vec![])], -5),
            activity(12, "B", vec![pathway(3, "c", vec![])], 7),
        ];
        let mut state = AnalysisState::new(&activities, &MapSettings::new());
        state.restack();
        let order: Vec<_> = state
            .activities()
            .iter()
            .map(|a| (a.name.as_str(), a.style_pixel_value))
            .collect();
        assert_eq!(order, vec![("A", 1), ("B", 2), ("C", 3)]);
    }
}
