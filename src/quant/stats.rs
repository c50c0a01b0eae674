//! Per-layer input statistics gathered during calibration forwards

use crate::nn::ForwardHook;
use crate::Result;
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use std::collections::BTreeMap;

/// Rows seen at the input of one linear layer
#[derive(Debug, Clone, Default)]
pub struct InputStats {
    batches: Vec<Array2<f32>>,
    rows: usize,
}

impl InputStats {
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// All captured rows stacked into `[rows, in]`
    pub fn stacked(&self) -> Option<Array2<f32>> {
        let views: Vec<ArrayView2<'_, f32>> = self.batches.iter().map(|b| b.view()).collect();
        if views.is_empty() {
            return None;
        }
        concatenate(Axis(0), &views).ok()
    }
}

/// Forward hook recording the inputs of selected linear layers
#[derive(Debug, Clone)]
pub struct InputCapture {
    targets: Option<Vec<String>>,
    max_rows: usize,
    stats: BTreeMap<String, InputStats>,
}

impl InputCapture {
    /// Capture every linear input, keeping at most `max_rows` rows per layer
    pub fn all(max_rows: usize) -> Self {
        Self {
            targets: None,
            max_rows,
            stats: BTreeMap::new(),
        }
    }

    /// Capture only the named layers
    pub fn only(names: impl IntoIterator<Item = String>, max_rows: usize) -> Self {
        Self {
            targets: Some(names.into_iter().collect()),
            max_rows,
            stats: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&InputStats> {
        self.stats.get(name)
    }

    /// Stacked inputs of one layer
    pub fn inputs(&self, name: &str) -> Option<Array2<f32>> {
        self.stats.get(name).and_then(InputStats::stacked)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stats.keys().map(String::as_str)
    }
}

impl ForwardHook for InputCapture {
    fn on_linear_input(&mut self, name: &str, x: ArrayView2<'_, f32>) -> Result<()> {
        if let Some(targets) = &self.targets {
            if !targets.iter().any(|t| t == name) {
                return Ok(());
            }
        }
        let entry = self.stats.entry(name.to_string()).or_default();
        let room = self.max_rows.saturating_sub(entry.rows);
        if room == 0 {
            return Ok(());
        }
        let take = room.min(x.nrows());
        entry.batches.push(x.slice(ndarray::s![..take, ..]).to_owned());
        entry.rows += take;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_capture_respects_row_budget() {
        let mut cap = InputCapture::all(3);
        cap.on_linear_input("fc", array![[1.0f32, 2.0], [3.0, 4.0]].view()).unwrap();
        cap.on_linear_input("fc", array![[5.0f32, 6.0], [7.0, 8.0]].view()).unwrap();
        let x = cap.inputs("fc").unwrap();
        assert_eq!(x.dim(), (3, 2));
        assert_eq!(x.row(2).to_vec(), vec![5.0, 6.0]);
    }

    #[test]
    fn test_capture_filters_targets() {
        let mut cap = InputCapture::only(vec!["a".to_string()], 10);
        cap.on_linear_input("b", array![[1.0f32]].view()).unwrap();
        assert!(cap.get("b").is_none());
        assert_eq!(cap.names().count(), 0);
    }
}
