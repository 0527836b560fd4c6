//! Geography index over the Region → City → Locality tree.
//!
//! The index is built once, validated at load time and read-only afterwards,
//! so it can be shared across aggregation workers behind an `Arc`.

use crate::error::{EpiError, Result};
use crate::models::{GeoKind, GeoUnit};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use tracing::debug;

/// The tree never exceeds Region → City → Locality.
const MAX_DEPTH: usize = 3;

/// Minimum length of a search term.
const MIN_SEARCH_LEN: usize = 2;

/// Read-only index of geographic units.
#[derive(Debug, Clone)]
pub struct GeographyIndex {
    units: HashMap<String, GeoUnit>,
    children: HashMap<String, Vec<String>>,
    /// Region ids ordered by name.
    regions: Vec<String>,
}

/// Counts and population per level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GeographySummary {
    pub regions: usize,
    pub cities: usize,
    pub localities: usize,
    /// Largest of the per-level population sums. Lower levels are often
    /// only partially surveyed, so no single level is authoritative.
    pub estimated_population: u64,
}

impl GeographyIndex {
    /// Build and validate an index.
    ///
    /// Fails with `InvalidHierarchy` on duplicate ids, dangling parents,
    /// cycles, or a parent of the wrong level.
    pub fn from_units(units: Vec<GeoUnit>) -> Result<Self> {
        let mut by_id: HashMap<String, GeoUnit> = HashMap::with_capacity(units.len());
        for unit in units {
            if unit.id.trim().is_empty() {
                return Err(EpiError::InvalidHierarchy(format!(
                    "unit '{}' has an empty id",
                    unit.name
                )));
            }
            if by_id.contains_key(&unit.id) {
                return Err(EpiError::InvalidHierarchy(format!(
                    "duplicate unit id '{}'",
                    unit.id
                )));
            }
            by_id.insert(unit.id.clone(), unit);
        }

        for unit in by_id.values() {
            if let Some(ref parent) = unit.parent {
                if !by_id.contains_key(parent) {
                    return Err(EpiError::InvalidHierarchy(format!(
                        "unit '{}' references missing parent '{}'",
                        unit.id, parent
                    )));
                }
            }
        }

        for unit in by_id.values() {
            check_acyclic(unit, &by_id)?;
        }

        for unit in by_id.values() {
            let parent_kind = unit
                .parent
                .as_ref()
                .and_then(|p| by_id.get(p))
                .map(|p| p.kind);
            if parent_kind != unit.kind.parent_kind() {
                return Err(EpiError::InvalidHierarchy(match unit.kind.parent_kind() {
                    Some(expected) => format!(
                        "{} '{}' must have a {} parent",
                        unit.kind, unit.id, expected
                    ),
                    None => format!("{} '{}' cannot have a parent", unit.kind, unit.id),
                }));
            }
        }

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for unit in by_id.values() {
            if let Some(ref parent) = unit.parent {
                children
                    .entry(parent.clone())
                    .or_default()
                    .push(unit.id.clone());
            }
        }
        for ids in children.values_mut() {
            ids.sort_by(|a, b| name_order(&by_id[a], &by_id[b]));
        }

        let mut regions: Vec<String> = by_id
            .values()
            .filter(|u| u.kind == GeoKind::Region)
            .map(|u| u.id.clone())
            .collect();
        regions.sort_by(|a, b| name_order(&by_id[a], &by_id[b]));

        debug!(
            "Geography index: {} units, {} regions",
            by_id.len(),
            regions.len()
        );

        Ok(Self {
            units: by_id,
            children,
            regions,
        })
    }

    /// Load an index from a JSON array of units.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let units: Vec<GeoUnit> = serde_json::from_str(&content)?;
        Self::from_units(units)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, geo_id: &str) -> Option<&GeoUnit> {
        self.units.get(geo_id)
    }

    pub fn resolve(&self, geo_id: &str) -> Result<&GeoUnit> {
        self.units
            .get(geo_id)
            .ok_or_else(|| EpiError::UnknownGeoUnit(geo_id.to_string()))
    }

    /// The unit itself followed by its ancestors, most specific first.
    pub fn ancestors(&self, geo_id: &str) -> Result<Vec<&GeoUnit>> {
        let mut chain = Vec::with_capacity(MAX_DEPTH);
        let mut current = Some(self.resolve(geo_id)?);
        while let Some(unit) = current {
            chain.push(unit);
            current = unit.parent.as_deref().and_then(|p| self.units.get(p));
        }
        Ok(chain)
    }

    /// Units of `kind` strictly below `geo_id`, ordered by name.
    pub fn descendants(&self, geo_id: &str, kind: GeoKind) -> Result<Vec<&GeoUnit>> {
        let mut found: Vec<&GeoUnit> = self
            .subtree(geo_id)?
            .into_iter()
            .filter(|u| u.id != geo_id && u.kind == kind)
            .collect();
        found.sort_by(|a, b| name_order(a, b));
        Ok(found)
    }

    /// The unit and everything below it, depth-first.
    pub fn subtree(&self, geo_id: &str) -> Result<Vec<&GeoUnit>> {
        let root = self.resolve(geo_id)?;
        let mut out = vec![root];
        let mut stack: Vec<&str> = vec![root.id.as_str()];
        while let Some(id) = stack.pop() {
            if let Some(kids) = self.children.get(id) {
                for kid in kids {
                    if let Some(unit) = self.units.get(kid) {
                        out.push(unit);
                        stack.push(unit.id.as_str());
                    }
                }
            }
        }
        Ok(out)
    }

    /// The region a unit belongs to.
    pub fn region_of(&self, geo_id: &str) -> Result<&GeoUnit> {
        let chain = self.ancestors(geo_id)?;
        chain
            .last()
            .copied()
            .ok_or_else(|| EpiError::UnknownGeoUnit(geo_id.to_string()))
    }

    /// All regions ordered by name.
    pub fn regions(&self) -> Vec<&GeoUnit> {
        self.regions
            .iter()
            .filter_map(|id| self.units.get(id))
            .collect()
    }

    /// Expand a geo-scope into units. Each id stands for itself and its
    /// subtree; an empty list means every unit.
    pub fn scope(&self, ids: &[String]) -> Result<Vec<&GeoUnit>> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut units: Vec<&GeoUnit> = Vec::new();

        let roots: Vec<&GeoUnit> = if ids.is_empty() {
            self.regions()
        } else {
            ids.iter()
                .map(|id| self.resolve(id))
                .collect::<Result<Vec<_>>>()?
        };

        for root in roots {
            for unit in self.subtree(&root.id)? {
                if seen.insert(unit.id.as_str()) {
                    units.push(unit);
                }
            }
        }

        units.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| name_order(a, b)));
        Ok(units)
    }

    /// Ids of every unit in a scope, grouped under their region.
    pub fn partition_by_region<'a>(
        &self,
        scope: &[&'a GeoUnit],
    ) -> Result<Vec<(String, BTreeSet<String>)>> {
        let mut groups: HashMap<String, BTreeSet<String>> = HashMap::new();
        for unit in scope {
            let region = self.region_of(&unit.id)?;
            groups
                .entry(region.id.clone())
                .or_default()
                .insert(unit.id.clone());
        }

        let mut ordered: Vec<(String, BTreeSet<String>)> = groups.into_iter().collect();
        ordered.sort_by(|(a, _), (b, _)| match (self.units.get(a), self.units.get(b)) {
            (Some(ua), Some(ub)) => name_order(ua, ub),
            _ => a.cmp(b),
        });
        Ok(ordered)
    }

    /// Case-insensitive search over names and codes.
    pub fn search(&self, term: &str) -> Result<Vec<&GeoUnit>> {
        let term = term.trim().to_lowercase();
        if term.chars().count() < MIN_SEARCH_LEN {
            return Err(EpiError::InvalidQuery(format!(
                "search term must have at least {} characters",
                MIN_SEARCH_LEN
            )));
        }

        let mut hits: Vec<&GeoUnit> = self
            .units
            .values()
            .filter(|u| {
                u.name.to_lowercase().contains(&term)
                    || u
                        .code
                        .as_deref()
                        .is_some_and(|c| c.to_lowercase().contains(&term))
            })
            .collect();
        hits.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| name_order(a, b)));
        Ok(hits)
    }

    pub fn summary(&self) -> GeographySummary {
        let mut summary = GeographySummary::default();
        let (mut pop_regions, mut pop_cities, mut pop_localities) = (0u64, 0u64, 0u64);

        for unit in self.units.values() {
            match unit.kind {
                GeoKind::Region => {
                    summary.regions += 1;
                    pop_regions += unit.estimated_population;
                }
                GeoKind::City => {
                    summary.cities += 1;
                    pop_cities += unit.estimated_population;
                }
                GeoKind::Locality => {
                    summary.localities += 1;
                    pop_localities += unit.estimated_population;
                }
            }
        }

        summary.estimated_population = pop_regions.max(pop_cities).max(pop_localities);
        summary
    }
}

fn name_order(a: &GeoUnit, b: &GeoUnit) -> std::cmp::Ordering {
    a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id))
}

fn check_acyclic(unit: &GeoUnit, units: &HashMap<String, GeoUnit>) -> Result<()> {
    let mut visited: HashSet<&str> = HashSet::new();
    visited.insert(unit.id.as_str());

    let mut current = unit.parent.as_deref();
    while let Some(id) = current {
        if !visited.insert(id) || visited.len() > MAX_DEPTH {
            return Err(EpiError::InvalidHierarchy(format!(
                "parent chain of '{}' revisits '{}' or exceeds depth {}",
                unit.id, id, MAX_DEPTH
            )));
        }
        current = units.get(id).and_then(|u| u.parent.as_deref());
    }
    Ok(())
}
