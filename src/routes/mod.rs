use axum::Router;

use crate::state::AppState;

pub mod example;
pub mod me;
pub mod pages;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(pages::page_routes())
        .merge(me::me_routes())
        .merge(example::example_routes())
}
