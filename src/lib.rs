//! Shadowgate - shadow-testing HTTP reverse proxy.
//!
//! Shadowgate sits between clients and a production (*main*) upstream. Every
//! request is forwarded to the main upstream and its response returned to
//! the client. For a configurable sample of requests the same request is
//! concurrently replayed against a candidate (*test*) upstream and the two
//! responses are compared - status, then headers, then body - with
//! divergences written to a structured sink (stdout or Elasticsearch).
//!
//! # Pipeline
//!
//! Front-end -> route matcher -> (skip?) -> main upstream call -> client
//! reply -> sampler -> worker queue -> comparison job -> comparator -> sink.
//!
//! The serving path never waits on shadow work: comparison jobs run on a
//! fixed worker pool behind a bounded queue, and a full queue drops the job
//! rather than exerting backpressure on the client.

pub mod compare;
pub mod config;
pub mod error;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod route;
pub mod sampler;
pub mod shadow;
pub mod storage;
pub mod upstream;
pub mod worker;
