mod auth;
mod client;
mod ticks;

pub use auth::{Credentials, encoded_entry};
pub use client::{
    Endpoints, ErrorClass, ObjectRef, ObjectStat, StoreClient, TransferConfig, TransferError,
};
pub use ticks::{TICKS_PER_MILLI, millis_to_ticks, now_millis, ticks_to_millis};
