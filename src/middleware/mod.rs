mod vendor_auth;

pub use vendor_auth::*;
