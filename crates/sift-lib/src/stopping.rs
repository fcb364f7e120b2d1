//! Stopping policies
//!
//! A policy is a predicate over the results so far and the full label vector
//! of the dataset. Every policy stops unconditionally once the pool is
//! exhausted; [`StoppingPolicy::rule`] only adds the policy's own condition.

use crate::error::{Result, SiftError};
use crate::models::{label_counts, Label, ResultRow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub trait StoppingPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// The policy's own condition, ignoring pool exhaustion
    fn rule(&self, results: &[ResultRow], labels: &[Label]) -> bool;

    fn stop(&self, results: &[ResultRow], labels: &[Label]) -> bool {
        pool_exhausted(results, labels) || self.rule(results, labels)
    }
}

/// No record is left outside the results table. An empty dataset is exhausted.
pub fn pool_exhausted(results: &[ResultRow], labels: &[Label]) -> bool {
    results.len() >= labels.len()
}

/// Run until every record is labeled
#[derive(Debug, Clone, Copy, Default)]
pub struct Exhaustion;

impl StoppingPolicy for Exhaustion {
    fn name(&self) -> &str {
        "exhaustion"
    }

    fn rule(&self, _results: &[ResultRow], _labels: &[Label]) -> bool {
        false
    }
}

/// Every relevant record in the ground truth has been found
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetFound;

impl StoppingPolicy for TargetFound {
    fn name(&self) -> &str {
        "target_found"
    }

    fn rule(&self, results: &[ResultRow], labels: &[Label]) -> bool {
        let target = labels.iter().filter(|l| l.is_relevant()).count();
        let (found, _) = label_counts(results);
        found >= target
    }
}

/// A fixed number of labeled records, priors included
#[derive(Debug, Clone, Copy)]
pub struct NLabeled(pub usize);

impl StoppingPolicy for NLabeled {
    fn name(&self) -> &str {
        "n_labeled"
    }

    fn rule(&self, results: &[ResultRow], _labels: &[Label]) -> bool {
        results.iter().filter(|r| r.label.is_some()).count() >= self.0
    }
}

/// At least `relevant` relevant and `irrelevant` irrelevant records found
#[derive(Debug, Clone, Copy)]
pub struct NFound {
    pub relevant: usize,
    pub irrelevant: usize,
}

impl StoppingPolicy for NFound {
    fn name(&self) -> &str {
        "n_found"
    }

    fn rule(&self, results: &[ResultRow], _labels: &[Label]) -> bool {
        let (relevant, irrelevant) = label_counts(results);
        relevant >= self.relevant && irrelevant >= self.irrelevant
    }
}

/// A fraction of the dataset labeled
#[derive(Debug, Clone, Copy)]
pub struct Quantile(pub f64);

impl StoppingPolicy for Quantile {
    fn name(&self) -> &str {
        "quantile"
    }

    fn rule(&self, results: &[ResultRow], labels: &[Label]) -> bool {
        let labeled = results.iter().filter(|r| r.label.is_some()).count();
        labeled as f64 >= self.0 * labels.len() as f64
    }
}

/// Both classes present, so a classifier can be trained
#[derive(Debug, Clone, Copy, Default)]
pub struct Fittable;

impl StoppingPolicy for Fittable {
    fn name(&self) -> &str {
        "fittable"
    }

    fn rule(&self, results: &[ResultRow], _labels: &[Label]) -> bool {
        let (relevant, irrelevant) = label_counts(results);
        relevant > 0 && irrelevant > 0
    }
}

/// The last `n` decisions were all irrelevant
#[derive(Debug, Clone, Copy)]
pub struct ConsecutiveIrrelevant(pub usize);

impl StoppingPolicy for ConsecutiveIrrelevant {
    fn name(&self) -> &str {
        "consecutive_irrelevant"
    }

    fn rule(&self, results: &[ResultRow], _labels: &[Label]) -> bool {
        let streak = results
            .iter()
            .rev()
            .filter_map(|r| r.label)
            .take_while(|l| !l.is_relevant())
            .count();
        streak >= self.0
    }
}

/// Stops as soon as any member stops
pub struct Any(pub Vec<Box<dyn StoppingPolicy>>);

impl StoppingPolicy for Any {
    fn name(&self) -> &str {
        "any"
    }

    fn rule(&self, results: &[ResultRow], labels: &[Label]) -> bool {
        self.0.iter().any(|p| p.rule(results, labels))
    }
}

/// Serializable description of a stopping policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoppingSpec {
    Exhaustion,
    TargetFound,
    NLabeled { n: usize },
    NFound { relevant: usize, irrelevant: usize },
    Quantile { fraction: f64 },
    Fittable,
    ConsecutiveIrrelevant { n: usize },
    Any { policies: Vec<StoppingSpec> },
}

impl Default for StoppingSpec {
    fn default() -> Self {
        StoppingSpec::Exhaustion
    }
}

impl StoppingSpec {
    pub fn validate(&self) -> Result<()> {
        match self {
            StoppingSpec::Quantile { fraction } if !(*fraction > 0.0 && *fraction <= 1.0) => Err(
                SiftError::config(format!("quantile must be within (0, 1], got {}", fraction)),
            ),
            StoppingSpec::Any { policies } if policies.is_empty() => {
                Err(SiftError::config("'any' needs at least one policy"))
            }
            StoppingSpec::Any { policies } => policies.iter().try_for_each(|p| p.validate()),
            _ => Ok(()),
        }
    }

    pub fn build(&self) -> Box<dyn StoppingPolicy> {
        match self {
            StoppingSpec::Exhaustion => Box::new(Exhaustion),
            StoppingSpec::TargetFound => Box::new(TargetFound),
            StoppingSpec::NLabeled { n } => Box::new(NLabeled(*n)),
            StoppingSpec::NFound {
                relevant,
                irrelevant,
            } => Box::new(NFound {
                relevant: *relevant,
                irrelevant: *irrelevant,
            }),
            StoppingSpec::Quantile { fraction } => Box::new(Quantile(*fraction)),
            StoppingSpec::Fittable => Box::new(Fittable),
            StoppingSpec::ConsecutiveIrrelevant { n } => Box::new(ConsecutiveIrrelevant(*n)),
            StoppingSpec::Any { policies } => {
                Box::new(Any(policies.iter().map(StoppingSpec::build).collect()))
            }
        }
    }
}

impl fmt::Display for StoppingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoppingSpec::Exhaustion => write!(f, "exhaustion"),
            StoppingSpec::TargetFound => write!(f, "target_found"),
            StoppingSpec::NLabeled { n } => write!(f, "n_labeled:{}", n),
            StoppingSpec::NFound {
                relevant,
                irrelevant,
            } => write!(f, "n_found:{},{}", relevant, irrelevant),
            StoppingSpec::Quantile { fraction } => write!(f, "quantile:{}", fraction),
            StoppingSpec::Fittable => write!(f, "fittable"),
            StoppingSpec::ConsecutiveIrrelevant { n } => write!(f, "consecutive_irrelevant:{}", n),
            StoppingSpec::Any { policies } => {
                let parts: Vec<String> = policies.iter().map(|p| p.to_string()).collect();
                write!(f, "{}", parts.join("+"))
            }
        }
    }
}

/// Compact form used on the command line: `name[:arg[,arg]]`, joined with `+`
/// for an `any` composite, e.g. `n_labeled:200+consecutive_irrelevant:50`.
impl FromStr for StoppingSpec {
    type Err = SiftError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('+').map(str::trim).collect();
        if parts.len() > 1 {
            let policies = parts
                .into_iter()
                .map(parse_single)
                .collect::<Result<Vec<_>>>()?;
            let spec = StoppingSpec::Any { policies };
            spec.validate()?;
            return Ok(spec);
        }
        let spec = parse_single(s.trim())?;
        spec.validate()?;
        Ok(spec)
    }
}

fn parse_single(s: &str) -> Result<StoppingSpec> {
    let (name, arg) = match s.split_once(':') {
        Some((name, arg)) => (name, Some(arg)),
        None => (s, None),
    };
    let bad = || SiftError::config(format!("invalid stopping policy '{}'", s));
    let int = |v: &str| v.trim().parse::<usize>().map_err(|_| bad());

    let spec = match (name, arg) {
        ("exhaustion", None) => StoppingSpec::Exhaustion,
        ("target_found", None) => StoppingSpec::TargetFound,
        ("fittable", None) => StoppingSpec::Fittable,
        ("n_labeled", Some(n)) => StoppingSpec::NLabeled { n: int(n)? },
        ("consecutive_irrelevant", Some(n)) => StoppingSpec::ConsecutiveIrrelevant { n: int(n)? },
        ("quantile", Some(q)) => StoppingSpec::Quantile {
            fraction: q.trim().parse().map_err(|_| bad())?,
        },
        ("n_found", Some(args)) => {
            let (relevant, irrelevant) = args.split_once(',').unwrap_or((args, "0"));
            StoppingSpec::NFound {
                relevant: int(relevant)?,
                irrelevant: int(irrelevant)?,
            }
        }
        _ => return Err(bad()),
    };
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(labels: &[u8]) -> Vec<ResultRow> {
        labels
            .iter()
            .enumerate()
            .map(|(i, &l)| ResultRow::prior(i as i64, Label::from(l == 1)))
            .collect()
    }

    fn truth(n_relevant: usize, n: usize) -> Vec<Label> {
        (0..n).map(|i| Label::from(i < n_relevant)).collect()
    }

    #[test]
    fn test_every_policy_stops_on_exhaustion() {
        let labels = truth(1, 3);
        let done = results(&[1, 0, 0]);
        let policies: Vec<Box<dyn StoppingPolicy>> = vec![
            Box::new(Exhaustion),
            Box::new(NLabeled(100)),
            Box::new(NFound {
                relevant: 5,
                irrelevant: 5,
            }),
            Box::new(Quantile(1.0)),
            Box::new(ConsecutiveIrrelevant(10)),
        ];
        for policy in &policies {
            assert!(policy.stop(&done, &labels), "{} did not stop", policy.name());
            assert!(!policy.stop(&results(&[0]), &labels));
        }
    }

    #[test]
    fn test_empty_dataset_stops() {
        assert!(Exhaustion.stop(&[], &[]));
    }

    #[test]
    fn test_target_found() {
        let labels = truth(2, 10);
        assert!(!TargetFound.stop(&results(&[1, 0]), &labels));
        assert!(TargetFound.stop(&results(&[1, 0, 1]), &labels));
    }

    #[test]
    fn test_counts() {
        let labels = truth(3, 10);
        let r = results(&[1, 0, 0, 1]);
        assert!(NLabeled(4).stop(&r, &labels));
        assert!(!NLabeled(5).stop(&r, &labels));
        assert!(NFound { relevant: 2, irrelevant: 2 }.stop(&r, &labels));
        assert!(!NFound { relevant: 3, irrelevant: 0 }.stop(&r, &labels));
        assert!(Quantile(0.4).stop(&r, &labels));
        assert!(!Quantile(0.5).stop(&r, &labels));
    }

    #[test]
    fn test_fittable() {
        let labels = truth(1, 10);
        assert!(!Fittable.stop(&results(&[0, 0]), &labels));
        assert!(Fittable.stop(&results(&[0, 1]), &labels));
    }

    #[test]
    fn test_consecutive_irrelevant_ignores_pending() {
        let labels = truth(1, 20);
        let mut r = results(&[1, 0, 0]);
        assert!(!ConsecutiveIrrelevant(3).stop(&r, &labels));
        let mut pending = ResultRow::prior(50, Label::Irrelevant);
        pending.label = None;
        r.push(pending);
        r.extend(results(&[0]).into_iter().map(|mut row| {
            row.record_id = 60;
            row
        }));
        assert!(ConsecutiveIrrelevant(3).stop(&r, &labels));
    }

    #[test]
    fn test_any() {
        let labels = truth(1, 10);
        let any = StoppingSpec::from_str("n_labeled:5+fittable").unwrap().build();
        assert!(any.stop(&results(&[0, 1]), &labels));
        assert!(!any.stop(&results(&[0, 0]), &labels));
    }

    #[test]
    fn test_spec_parse_and_serde() {
        assert_eq!(
            "n_found:3,1".parse::<StoppingSpec>().unwrap(),
            StoppingSpec::NFound {
                relevant: 3,
                irrelevant: 1
            }
        );
        assert!("quantile:1.5".parse::<StoppingSpec>().is_err());
        assert!("n_labeled".parse::<StoppingSpec>().is_err());
        assert!("forever".parse::<StoppingSpec>().is_err());

        let spec: StoppingSpec =
            serde_json::from_str(r#"{"type": "consecutive_irrelevant", "n": 50}"#).unwrap();
        assert_eq!(spec.to_string(), "consecutive_irrelevant:50");
        assert_eq!(spec.to_string().parse::<StoppingSpec>().unwrap(), spec);
    }
}
