//! Period aggregation.
//!
//! Turns a record set into one [`PeriodAggregate`] per unit in scope, rolling
//! each record up to every in-scope ancestor in a single pass, and provides
//! helpers for summarizing the resulting aggregates.

use crate::config::AggregatorConfig;
use crate::geography::GeographyIndex;
use crate::models::{ConditionCount, GeoKind, GeoUnit, HealthRecord, PeriodAggregate};
use crate::period::Period;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Aggregation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationConfig {
    /// Length of each aggregate's top-conditions list.
    pub top_n: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self { top_n: 10 }
    }
}

impl From<&AggregatorConfig> for AggregationConfig {
    fn from(config: &AggregatorConfig) -> Self {
        Self {
            top_n: config.top_n,
        }
    }
}

/// Result of aggregating one record set for one period.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationOutcome {
    /// One aggregate per unit in scope, keyed by unit id.
    pub aggregates: BTreeMap<String, PeriodAggregate>,
    /// Records whose geography reference did not resolve.
    pub unclassified: PeriodAggregate,
    /// Records dated outside the period.
    pub out_of_period: u64,
    /// Records resolving only to units outside the scope.
    pub out_of_scope: u64,
}

impl AggregationOutcome {
    pub fn empty(period: Period) -> Self {
        Self {
            aggregates: BTreeMap::new(),
            unclassified: PeriodAggregate::unclassified(period),
            out_of_period: 0,
            out_of_scope: 0,
        }
    }

    /// Records counted at region level plus the unclassified bucket.
    pub fn classified_total(&self) -> u64 {
        self.aggregates
            .values()
            .filter(|a| a.geo_kind == Some(GeoKind::Region))
            .map(|a| a.total_records)
            .sum::<u64>()
            + self.unclassified.total_records
    }
}

/// Single-pass aggregation engine.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    config: AggregationConfig,
}

impl Aggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// Aggregate `records` for `period` over `scope`.
    ///
    /// Every unit of `scope` gets an aggregate, zeroed when no record
    /// touches it. Unresolvable references land in the unclassified bucket
    /// and never fail the call.
    pub fn aggregate<'a, I>(
        &self,
        records: I,
        period: &Period,
        geo: &GeographyIndex,
        scope: &[&GeoUnit],
    ) -> AggregationOutcome
    where
        I: IntoIterator<Item = &'a HealthRecord>,
    {
        let mut outcome = AggregationOutcome::empty(*period);
        for unit in scope {
            outcome
                .aggregates
                .insert(unit.id.clone(), PeriodAggregate::empty(unit, *period));
        }

        for record in records {
            if !period.contains(&record.timestamp) {
                outcome.out_of_period += 1;
                continue;
            }

            let chain = match geo.ancestors(&record.patient_region_ref) {
                Ok(chain) => chain,
                Err(_) => {
                    outcome.unclassified.record(record);
                    continue;
                }
            };

            let mut counted = false;
            for unit in chain {
                if let Some(aggregate) = outcome.aggregates.get_mut(&unit.id) {
                    aggregate.record(record);
                    counted = true;
                }
            }
            if !counted {
                outcome.out_of_scope += 1;
            }
        }

        self.finalize(&mut outcome);
        debug!(
            "Aggregated {} units for {} ({} unclassified, {} out of scope)",
            outcome.aggregates.len(),
            period,
            outcome.unclassified.total_records,
            outcome.out_of_scope
        );
        outcome
    }

    /// Combine slice outcomes of the same period into one.
    pub fn merge<I>(&self, period: Period, parts: I) -> AggregationOutcome
    where
        I: IntoIterator<Item = AggregationOutcome>,
    {
        let mut merged = AggregationOutcome::empty(period);

        for part in parts {
            for (id, aggregate) in part.aggregates {
                match merged.aggregates.get_mut(&id) {
                    Some(existing) => existing.absorb(&aggregate),
                    None => {
                        merged.aggregates.insert(id, aggregate);
                    }
                }
            }
            merged.unclassified.absorb(&part.unclassified);
            merged.out_of_period += part.out_of_period;
            merged.out_of_scope += part.out_of_scope;
        }

        self.finalize(&mut merged);
        merged
    }

    fn finalize(&self, outcome: &mut AggregationOutcome) {
        for aggregate in outcome.aggregates.values_mut() {
            aggregate.top_conditions = top_conditions(&aggregate.condition_counts, self.config.top_n);
        }
        outcome.unclassified.top_conditions =
            top_conditions(&outcome.unclassified.condition_counts, self.config.top_n);
    }
}

/// The `n` most frequent conditions, ties broken by code.
pub fn top_conditions(counts: &BTreeMap<String, u64>, n: usize) -> Vec<ConditionCount> {
    let mut ranked: Vec<ConditionCount> = counts
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(code, count)| ConditionCount {
            condition_code: code.clone(),
            count: *count,
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.condition_code.cmp(&b.condition_code))
    });
    ranked.truncate(n);
    ranked
}

/// Aggregates whose unit has no ancestor among `units`.
///
/// Summing these never counts a record twice.
pub fn scope_roots<'a>(aggregates: &'a [PeriodAggregate], units: &[GeoUnit]) -> Vec<&'a PeriodAggregate> {
    let included: HashSet<&str> = units.iter().map(|u| u.id.as_str()).collect();
    let parents: HashMap<&str, Option<&str>> = units
        .iter()
        .map(|u| (u.id.as_str(), u.parent.as_deref()))
        .collect();

    aggregates
        .iter()
        .filter(|a| !a.is_unclassified())
        .filter(|a| {
            parents
                .get(a.geo_unit_id.as_str())
                .copied()
                .flatten()
                .map_or(true, |parent| !included.contains(parent))
        })
        .collect()
}

/// Total count per condition across `aggregates`.
pub fn condition_distribution(aggregates: &[&PeriodAggregate]) -> BTreeMap<String, u64> {
    let mut dist: BTreeMap<String, u64> = BTreeMap::new();

    for aggregate in aggregates {
        for (code, count) in &aggregate.condition_counts {
            *dist.entry(code.clone()).or_default() += count;
        }
    }

    dist
}

/// Identify the most affected units (by record count).
pub fn most_affected_units(aggregates: &[PeriodAggregate], n: usize) -> Vec<(&PeriodAggregate, u64)> {
    let mut ranked: Vec<_> = aggregates
        .iter()
        .filter(|a| !a.is_unclassified())
        .map(|a| (a, a.total_records))
        .filter(|(_, count)| *count > 0)
        .collect();

    ranked.sort_by(|(a, ca), (b, cb)| cb.cmp(ca).then_with(|| a.geo_name.cmp(&b.geo_name)));
    ranked.truncate(n);

    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geography::tests::sample_index;
    use crate::ingestion::tests::raw;

    fn march() -> Period {
        Period::month(2024, 3).unwrap()
    }

    fn rec(geo: &str, condition: &str, day: u32) -> HealthRecord {
        raw(geo, condition, &format!("2024-03-{:02}T10:00:00Z", day))
            .normalize()
            .unwrap()
    }

    fn locality_records() -> Vec<HealthRecord> {
        vec![
            rec("bandim", "malaria", 1),
            rec("bandim", "malaria", 2),
            rec("bandim", "dengue", 3),
            rec("mindara", "malaria", 4),
            rec("mindara", "cholera", 5),
            rec("prabis-centro", "malaria", 6),
            rec("sintcha", "dengue", 7),
        ]
    }

    #[test]
    fn test_rollup_consistency() {
        let geo = sample_index();
        let scope = geo.scope(&[]).unwrap();
        let records = locality_records();

        let outcome = Aggregator::default().aggregate(&records, &march(), &geo, &scope);
        let total = |id: &str| outcome.aggregates[id].total_records;

        assert_eq!(total("bandim"), 3);
        assert_eq!(total("bandim") + total("mindara"), total("bissau-city"));
        assert_eq!(total("prabis-centro"), total("prabis"));
        assert_eq!(total("bissau-city") + total("prabis"), total("bissau"));
        assert_eq!(total("sintcha"), total("gabu-city"));
        assert_eq!(total("gabu-city"), total("gabu"));
        assert_eq!(total("bissau") + total("gabu"), records.len() as u64);

        let bissau = &outcome.aggregates["bissau"];
        assert_eq!(bissau.count_for("malaria"), 4);
        assert_eq!(bissau.top_conditions[0].condition_code, "malaria");
    }

    #[test]
    fn test_unclassified_accounting() {
        let geo = sample_index();
        let scope = geo.scope(&[]).unwrap();
        let mut records = locality_records();
        records.push(rec("prabis", "malaria", 8));
        records.push(rec("gabu", "measles", 9));
        records.push(rec("atlantis", "malaria", 10));
        records.push(rec("", "malaria", 11));
        records.push(
            raw("bandim", "malaria", "2024-04-01T00:00:00Z")
                .normalize()
                .unwrap(),
        );

        let outcome = Aggregator::default().aggregate(&records, &march(), &geo, &scope);

        assert_eq!(outcome.unclassified.total_records, 2);
        assert_eq!(outcome.unclassified.count_for("malaria"), 2);
        assert_eq!(outcome.out_of_period, 1);
        assert_eq!(outcome.out_of_scope, 0);
        assert_eq!(outcome.classified_total(), records.len() as u64 - 1);
        assert_eq!(outcome.aggregates["prabis"].total_records, 2);
        assert_eq!(outcome.aggregates["gabu"].total_records, 2);
    }

    #[test]
    fn test_partial_scope() {
        let geo = sample_index();
        let scope = geo.scope(&["bissau-city".to_string()]).unwrap();
        let records = vec![
            rec("bandim", "malaria", 1),
            rec("sintcha", "malaria", 2),
            rec("bissau", "malaria", 3),
        ];

        let outcome = Aggregator::default().aggregate(&records, &march(), &geo, &scope);

        assert_eq!(outcome.aggregates.len(), 3);
        assert!(!outcome.aggregates.contains_key("bissau"));
        assert_eq!(outcome.aggregates["bissau-city"].total_records, 1);
        assert_eq!(outcome.out_of_scope, 2);
    }

    #[test]
    fn test_empty_records_yield_zero_aggregates() {
        let geo = sample_index();
        let scope = geo.scope(&[]).unwrap();
        let outcome = Aggregator::default().aggregate(&Vec::<HealthRecord>::new(), &march(), &geo, &scope);

        assert_eq!(outcome.aggregates.len(), geo.len());
        assert!(outcome
            .aggregates
            .values()
            .all(|a| a.total_records == 0 && a.top_conditions.is_empty()));
        assert_eq!(outcome.unclassified.total_records, 0);
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let geo = sample_index();
        let scope = geo.scope(&[]).unwrap();
        let records = locality_records();
        let aggregator = Aggregator::default();

        let first = aggregator.aggregate(&records, &march(), &geo, &scope);
        let second = aggregator.aggregate(&records, &march(), &geo, &scope);
        assert_eq!(first, second);

        let bytes = |o: &AggregationOutcome| {
            serde_json::to_vec(&o.aggregates.values().collect::<Vec<_>>()).unwrap()
        };
        assert_eq!(bytes(&first), bytes(&second));
    }

    #[test]
    fn test_merge_matches_single_pass() {
        let geo = sample_index();
        let scope = geo.scope(&[]).unwrap();
        let records = locality_records();
        let aggregator = Aggregator::default();

        let whole = aggregator.aggregate(&records, &march(), &geo, &scope);

        let (bissau_units, gabu_units): (Vec<&GeoUnit>, Vec<&GeoUnit>) = scope
            .iter()
            .copied()
            .partition(|u| geo.region_of(&u.id).unwrap().id == "bissau");
        let (bissau_records, gabu_records): (Vec<&HealthRecord>, Vec<&HealthRecord>) = records
            .iter()
            .partition(|r| geo.region_of(&r.patient_region_ref).unwrap().id == "bissau");

        let merged = aggregator.merge(
            march(),
            vec![
                aggregator.aggregate(gabu_records, &march(), &geo, &gabu_units),
                aggregator.aggregate(bissau_records, &march(), &geo, &bissau_units),
            ],
        );
        assert_eq!(merged, whole);
    }

    #[test]
    fn test_top_conditions_tie_break() {
        let counts: BTreeMap<String, u64> = [("dengue", 2), ("cholera", 2), ("malaria", 5), ("flu", 1)]
            .into_iter()
            .map(|(c, n)| (c.to_string(), n))
            .collect();

        let top = top_conditions(&counts, 3);
        let codes: Vec<_> = top.iter().map(|c| c.condition_code.as_str()).collect();
        assert_eq!(codes, vec!["malaria", "cholera", "dengue"]);
    }

    #[test]
    fn test_scope_roots_and_distribution() {
        let geo = sample_index();
        let scope = geo.scope(&["bissau-city".to_string(), "gabu".to_string()]).unwrap();
        let units: Vec<GeoUnit> = scope.iter().map(|u| (*u).clone()).collect();
        let records = locality_records();

        let outcome = Aggregator::default().aggregate(&records, &march(), &geo, &scope);
        let aggregates: Vec<PeriodAggregate> = outcome.aggregates.into_values().collect();

        let roots = scope_roots(&aggregates, &units);
        let mut root_ids: Vec<_> = roots.iter().map(|a| a.geo_unit_id.as_str()).collect();
        root_ids.sort();
        assert_eq!(root_ids, vec!["bissau-city", "gabu"]);

        let dist = condition_distribution(&roots);
        assert_eq!(dist.get("malaria"), Some(&3));
        assert_eq!(dist.get("dengue"), Some(&2));
        assert_eq!(dist.get("cholera"), Some(&1));

        let affected = most_affected_units(&aggregates, 2);
        assert_eq!(affected[0].0.geo_unit_id, "bissau-city");
        assert_eq!(affected[0].1, 5);
        assert!(affected.iter().all(|(a, _)| a.geo_kind.is_some()));
        assert_eq!(
            aggregates.iter().find(|a| a.geo_unit_id == "gabu").map(|a| a.geo_kind),
            Some(Some(GeoKind::Region))
        );
    }
}
