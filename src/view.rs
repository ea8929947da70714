use std::collections::BTreeMap;

use hyped::*;
use plotly::{layout::Axis, Bar, Layout, Plot};

use crate::metric::MetricId;

const PLOTLY_JS: &str = "https://cdn.plot.ly/plotly-2.12.1.min.js";

/// The `GET /` page: every stored metric as a list, plus a bar chart of the gauges.
pub fn dashboard_html(
    gauges: &BTreeMap<MetricId, f64>,
    counters: &BTreeMap<MetricId, i64>,
) -> String {
    let list = metric_list(gauges, counters);
    let chart = danger(gauge_chart_html(gauges));
    let plotly = script(()).src(PLOTLY_JS);
    let root_div = div((plotly, list, chart));
    let body = hyped::body(root_div);
    let root = (doctype(), html(body));
    render(root)
}

fn metric_list(
    gauges: &BTreeMap<MetricId, f64>,
    counters: &BTreeMap<MetricId, i64>,
) -> Element {
    let items = gauges
        .iter()
        .map(|(id, value)| li(format!("{id}: {value}")))
        .chain(counters.iter().map(|(id, delta)| li(format!("{id}: {delta}"))))
        .collect::<Vec<_>>();
    ul(items)
}

fn gauge_chart_html(gauges: &BTreeMap<MetricId, f64>) -> String {
    if gauges.is_empty() {
        return String::new();
    }
    let ids: Vec<String> = gauges.keys().cloned().collect();
    let values: Vec<f64> = gauges.values().copied().collect();
    let mut plot = Plot::new();
    plot.add_trace(Bar::new(ids, values).name("gauges"));
    let layout = Layout::default()
        .x_axis(Axis::default().title("metric"))
        .y_axis(Axis::default().title("value"));
    plot.set_layout(layout);
    plot.to_inline_html(Some("gauges"))
}
