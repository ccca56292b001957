use std::collections::HashMap;

use serde::Serialize;

use crate::{
    aggregate::{Aggregation, FirstSeen, ModelShare, TimeBucketPoint},
    render::{QuotaDisplay, render_number},
};

pub const BAR_TITLE: &str = "Model usage";
pub const PIE_TITLE: &str = "Model call share";

/// Stacked bar chart: usage per time bucket, stacked by model.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BarSpec {
    pub title: String,
    pub subtitle: String,
    pub values: Vec<TimeBucketPoint>,
}

/// One bar of the stacked chart.
#[derive(Debug, PartialEq)]
pub struct Stack<'a> {
    pub label: &'a str,
    pub segments: Vec<(&'a str, f64)>,
    pub total: f64,
}

impl BarSpec {
    pub fn empty() -> Self {
        BarSpec {
            title: BAR_TITLE.to_string(),
            subtitle: "0".to_string(),
            values: Vec::new(),
        }
    }

    pub fn from_aggregation(agg: &Aggregation, display: &QuotaDisplay) -> Self {
        BarSpec {
            title: BAR_TITLE.to_string(),
            subtitle: format!("Total: {}", display.render_quota(agg.consume_quota, 2)),
            values: agg.bar.clone(),
        }
    }

    /// Series names in legend order.
    pub fn models(&self) -> Vec<&str> {
        let mut models = FirstSeen::new();
        for point in &self.values {
            models.entry(point.model.as_str(), || point.model.as_str());
        }
        models.into_rows()
    }

    /// Bars in time order of first appearance; segments follow legend order.
    pub fn stacks(&self) -> Vec<Stack<'_>> {
        let rank: HashMap<&str, usize> = self
            .models()
            .into_iter()
            .enumerate()
            .map(|(idx, model)| (model, idx))
            .collect();
        let mut stacks = FirstSeen::new();
        for point in &self.values {
            let stack = stacks.entry(point.time_label.as_str(), || Stack {
                label: &point.time_label,
                segments: Vec::new(),
                total: 0.0,
            });
            stack.segments.push((point.model.as_str(), point.usage));
            stack.total += point.usage;
        }
        let mut stacks = stacks.into_rows();
        for stack in &mut stacks {
            stack.segments.sort_by_key(|(model, _)| rank.get(model).copied());
        }
        stacks
    }
}

/// Donut chart: call count share per model, largest first.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PieSpec {
    pub title: String,
    pub subtitle: String,
    pub values: Vec<ModelShare>,
}

impl PieSpec {
    pub fn placeholder() -> Self {
        PieSpec {
            title: PIE_TITLE.to_string(),
            subtitle: String::new(),
            values: vec![ModelShare {
                model: "null".to_string(),
                value: 0,
            }],
        }
    }

    pub fn from_aggregation(agg: &Aggregation) -> Self {
        let mut values = agg.pie.clone();
        values.sort_by(|a, b| b.value.cmp(&a.value));
        PieSpec {
            title: PIE_TITLE.to_string(),
            subtitle: format!("Total: {}", render_number(agg.times)),
            values,
        }
    }

    pub fn total(&self) -> u64 {
        self.values.iter().map(|s| s.value).sum()
    }

    pub fn percent(&self, value: u64) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            value as f64 / total as f64 * 100.0
        }
    }
}

/// A live chart: its current spec plus how often it was updated and laid out.
#[derive(Debug)]
pub struct ChartHandle<S> {
    spec: S,
    updates: u64,
    layouts: u64,
}

impl<S> ChartHandle<S> {
    fn new(spec: S) -> Self {
        ChartHandle {
            spec,
            updates: 0,
            layouts: 0,
        }
    }

    pub fn spec(&self) -> &S {
        &self.spec
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn layouts(&self) -> u64 {
        self.layouts
    }

    fn update_spec(&mut self, spec: S) {
        self.spec = spec;
        self.updates += 1;
    }

    fn relayout(&mut self) {
        self.layouts += 1;
    }
}

enum ChartState {
    Uninitialized,
    Ready {
        bar: ChartHandle<BarSpec>,
        pie: ChartHandle<PieSpec>,
    },
}

/// Owns the bar and pie chart handles for one view. Handles are created on
/// first use and only ever updated afterwards.
pub struct ChartSync {
    state: ChartState,
    creations: u32,
    display: QuotaDisplay,
}

impl ChartSync {
    pub fn new(display: QuotaDisplay) -> Self {
        ChartSync {
            state: ChartState::Uninitialized,
            creations: 0,
            display,
        }
    }

    /// Returns true only on the call that created the handles.
    pub fn ensure_initialized(&mut self) -> bool {
        if let ChartState::Ready { .. } = self.state {
            return false;
        }
        self.state = ChartState::Ready {
            bar: ChartHandle::new(BarSpec::empty()),
            pie: ChartHandle::new(PieSpec::placeholder()),
        };
        self.creations += 1;
        tracing::debug!("chart handles created");
        true
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, ChartState::Ready { .. })
    }

    pub fn apply(&mut self, agg: &Aggregation) {
        self.ensure_initialized();
        let bar_spec = BarSpec::from_aggregation(agg, &self.display);
        let pie_spec = PieSpec::from_aggregation(agg);
        if let ChartState::Ready { bar, pie } = &mut self.state {
            pie.update_spec(pie_spec);
            bar.update_spec(bar_spec);
            pie.relayout();
            bar.relayout();
        }
    }

    pub fn bar(&self) -> Option<&ChartHandle<BarSpec>> {
        match &self.state {
            ChartState::Ready { bar, .. } => Some(bar),
            ChartState::Uninitialized => None,
        }
    }

    pub fn pie(&self) -> Option<&ChartHandle<PieSpec>> {
        match &self.state {
            ChartState::Ready { pie, .. } => Some(pie),
            ChartState::Uninitialized => None,
        }
    }

    pub fn creations(&self) -> u32 {
        self.creations
    }
}
