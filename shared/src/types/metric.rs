//! Metric group and metric properties, and the typed values they decode into

use serde::{Deserialize, Serialize};

/// How a metric group collects its samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SamplingType {
    /// Begin/end snapshots taken by queries embedded in a command list
    EventBased,
    /// Periodic sampling into a ring buffer, read by a streamer
    TimeBased,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricGroupProperties {
    pub name: String,
    pub description: String,
    pub sampling_type: SamplingType,
    /// Groups sharing a domain cannot be active at the same time
    pub domain: u32,
    pub metric_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    Duration,
    Event,
    EventWithRange,
    Throughput,
    Timestamp,
    Flag,
    Ratio,
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Uint32,
    Uint64,
    Float32,
    Float64,
    Bool8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricProperties {
    pub name: String,
    pub description: String,
    pub component: String,
    pub tier_number: u32,
    pub metric_type: MetricType,
    pub result_type: ValueType,
    pub result_units: String,
}

/// A decoded metric value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TypedValue {
    Uint32(u32),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    Bool8(bool),
}

impl TypedValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            TypedValue::Uint32(_) => ValueType::Uint32,
            TypedValue::Uint64(_) => ValueType::Uint64,
            TypedValue::Float32(_) => ValueType::Float32,
            TypedValue::Float64(_) => ValueType::Float64,
            TypedValue::Bool8(_) => ValueType::Bool8,
        }
    }

    /// Lossy conversion used for display and summaries
    pub fn as_f64(&self) -> f64 {
        match *self {
            TypedValue::Uint32(v) => v as f64,
            TypedValue::Uint64(v) => v as f64,
            TypedValue::Float32(v) => v as f64,
            TypedValue::Float64(v) => v,
            TypedValue::Bool8(v) => {
                if v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl std::fmt::Display for TypedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypedValue::Uint32(v) => write!(f, "{}", v),
            TypedValue::Uint64(v) => write!(f, "{}", v),
            TypedValue::Float32(v) => write!(f, "{:.3}", v),
            TypedValue::Float64(v) => write!(f, "{:.3}", v),
            TypedValue::Bool8(v) => write!(f, "{}", v),
        }
    }
}

/// Which values a calculation produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalculationType {
    /// Values derived from the raw reports
    MetricValues,
    /// Maximum values the counters could reach over the same interval
    MaxMetricValues,
}

/// Output of a multiple-value calculation: one metric count per result set
/// and the values of all result sets concatenated in order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalculatedValues {
    pub metric_counts: Vec<u32>,
    pub values: Vec<TypedValue>,
}

impl CalculatedValues {
    pub fn data_count(&self) -> u32 {
        self.metric_counts.len() as u32
    }

    pub fn total_metric_count(&self) -> u32 {
        self.metric_counts.iter().sum()
    }

    /// Append one result set
    pub fn push_set(&mut self, values: Vec<TypedValue>) {
        self.metric_counts.push(values.len() as u32);
        self.values.extend(values);
    }

    /// Iterate over result sets as slices
    pub fn sets(&self) -> impl Iterator<Item = &[TypedValue]> {
        let values = self.values.as_slice();
        let mut start = 0usize;
        self.metric_counts.iter().map(move |&count| {
            let end = start + count as usize;
            let set = &values[start..end];
            start = end;
            set
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_value_conversion() {
        assert_eq!(TypedValue::Uint64(42).as_f64(), 42.0);
        assert_eq!(TypedValue::Bool8(true).as_f64(), 1.0);
        assert_eq!(TypedValue::Float32(1.5).value_type(), ValueType::Float32);
    }

    #[test]
    fn test_calculated_values_sets() {
        let mut out = CalculatedValues::default();
        out.push_set(vec![TypedValue::Uint64(1), TypedValue::Uint64(2)]);
        out.push_set(vec![TypedValue::Uint64(3)]);

        assert_eq!(out.data_count(), 2);
        assert_eq!(out.total_metric_count(), 3);

        let sets: Vec<_> = out.sets().collect();
        assert_eq!(sets[0], &[TypedValue::Uint64(1), TypedValue::Uint64(2)]);
        assert_eq!(sets[1], &[TypedValue::Uint64(3)]);
    }

    #[test]
    fn test_properties_json() {
        let props = MetricGroupProperties {
            name: "ComputeBasic".to_string(),
            description: "Compute metrics".to_string(),
            sampling_type: SamplingType::TimeBased,
            domain: 0,
            metric_count: 12,
        };
        let json = serde_json::to_string(&props).unwrap();
        assert!(json.contains("TimeBased"));
        let back: MetricGroupProperties = serde_json::from_str(&json).unwrap();
        assert_eq!(back, props);
    }
}
