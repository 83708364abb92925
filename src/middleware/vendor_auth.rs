use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::db::{AppState, queries};
use crate::error::{AppError, Result};
use crate::models::{Shop, User};
use crate::tenancy::bearer_token;

/// The authenticated vendor and the shop they manage.
#[derive(Clone)]
pub struct VendorContext {
    pub user: User,
    pub shop: Shop,
}

impl VendorContext {
    pub fn shop_id(&self) -> &str {
        &self.shop.id
    }
}

/// Authenticate a vendor API key and bind the request to their shop.
pub async fn vendor_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let api_key = bearer_token(request.headers())
        .ok_or(AppError::Unauthorized)?
        .to_string();

    let ctx = {
        let conn = state.db.get()?;
        let user = queries::get_user_by_api_key(&conn, &api_key)?.ok_or(AppError::Unauthorized)?;
        let shop = queries::require_user_shop(&conn, &user)?;
        VendorContext { user, shop }
    };

    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}
