#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_topic(name: &'static str, topic: &str) {
    metrics::increment_counter!(name, "topic" => topic.to_string());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_topic(_name: &'static str, _topic: &str) {}

pub(crate) const DELIVERY_SUCCESS: &str = "resthook.delivery.success";
pub(crate) const DELIVERY_FAILURE: &str = "resthook.delivery.failure";
pub(crate) const FILTER_REJECTED: &str = "resthook.filter.rejected";
pub(crate) const FILTER_ERROR: &str = "resthook.filter.error";
pub(crate) const CONFIRM_SUCCESS: &str = "resthook.confirm.success";
pub(crate) const CONFIRM_FAILURE: &str = "resthook.confirm.failure";
