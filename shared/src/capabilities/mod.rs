mod clock;
mod connectivity;
mod http;
mod kv;

#[cfg(feature = "reqwest-transport")]
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::connectivity::{ConnectivityMonitor, ConnectivityProbe, HttpConnectivityProbe};
pub use self::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpResult, HttpTransport,
    ValidatedUrl, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS,
};
pub use self::kv::{
    load_json, store_json, KeyNamespace, KvError, KvKey, KvStore, KvValue, MemoryKvStore,
    StorageErrorCode, ABSENT_VERSION,
};

#[cfg(feature = "reqwest-transport")]
pub use self::transport::ReqwestTransport;

pub(crate) use self::kv::check_value_size;

