/// Marker for request types that can be dispatched through a `Broker`.
///
/// Messages carry caller-defined payload only; the marker exists so that
/// dispatch is opt-in per type.
pub trait Message: Send + Sync + 'static {}
