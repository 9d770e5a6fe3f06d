//! Loss curves from a saved `trainer_state.json`

use crate::error::TunerResult;
use crate::trainer::{TrainerState, TRAINER_STATE_FILENAME};
use plotly::{
    common::Mode,
    layout::Axis,
    Layout, Plot, Scatter,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Exponential moving average whose weight grows with the series length
pub fn smooth(scalars: &[f64]) -> Vec<f64> {
    let Some(first) = scalars.first() else {
        return vec![];
    };
    let weight = 1.8 * (1. / (1. + (-0.05 * scalars.len() as f64).exp()) - 0.5);
    let mut last = *first;
    scalars
        .iter()
        .map(|next| {
            last = last * weight + (1. - weight) * next;
            last
        })
        .collect()
}

/// Renders one HTML plot per key of the log history.
///
/// Keys that never appear in the history are skipped with a warning. Returns
/// the paths of the written files.
pub fn plot_loss<P: AsRef<Path>>(output_dir: P, keys: &[&str]) -> TunerResult<Vec<PathBuf>> {
    let output_dir = output_dir.as_ref();
    let state = TrainerState::from_json_file(output_dir.join(TRAINER_STATE_FILENAME))?;

    let mut written = vec![];
    for key in keys {
        let (steps, values): (Vec<usize>, Vec<f64>) = state
            .log_history
            .iter()
            .filter_map(|entry| entry.values.get(*key).map(|v| (entry.step, *v)))
            .unzip();
        if values.is_empty() {
            warn!(key, "No metric to plot");
            continue;
        }

        let original = Scatter::new(steps.clone(), values.clone())
            .name("original")
            .opacity(0.4)
            .mode(Mode::Lines);
        let smoothed = Scatter::new(steps, smooth(&values))
            .name("smoothed")
            .mode(Mode::Lines);
        let title = format!("training {key} of {}", output_dir.display());
        let layout = Layout::new()
            .title(title.as_str())
            .x_axis(Axis::new().title("step"))
            .y_axis(Axis::new().title(*key));

        let mut plot = Plot::new();
        plot.add_trace(original);
        plot.add_trace(smoothed);
        plot.set_layout(layout);

        let save_path = output_dir.join(format!("training_{}.html", key.replace('/', "_")));
        std::fs::write(&save_path, plot.to_html())?;
        info!(path = %save_path.display(), "Saved loss figure");
        written.push(save_path);
    }
    Ok(written)
}
