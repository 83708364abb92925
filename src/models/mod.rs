mod api_key;
mod event;
mod media;
mod plan;
mod shop;
mod subscription;
mod tenant;
mod usage;
mod user;

pub use api_key::*;
pub use event::*;
pub use media::*;
pub use plan::*;
pub use shop::*;
pub use subscription::*;
pub use tenant::*;
pub use usage::*;
pub use user::*;
