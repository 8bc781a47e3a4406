use crate::api::{
    error::ApiError,
    service::{
        self, AddTokensRequest, BalancesQuery, IgnoreTokensRequest, RefreshRequest, TokensQuery,
        WatchRequest,
    },
};
use actix_web::{delete, get, post, web, HttpResponse, Responder};
use asset_tracker::controller::BalancesController;
use std::sync::Arc;

pub type Controller = web::Data<Arc<BalancesController>>;

#[get("/balances")]
async fn get_balances(
    controller: Controller,
    query: web::Query<BalancesQuery>,
) -> Result<impl Responder, ApiError> {
    log::info!("get_balances - {:?}", query);
    Ok(web::Json(service::get_balances(&controller, &query)?))
}

#[post("/balances/refresh")]
async fn refresh_balances(
    controller: Controller,
    body: web::Json<RefreshRequest>,
) -> Result<impl Responder, ApiError> {
    log::info!("refresh_balances - {:?}", body);
    Ok(web::Json(service::refresh_balances(&controller, &body).await?))
}

#[get("/tokens")]
async fn get_tokens(
    controller: Controller,
    query: web::Query<TokensQuery>,
) -> Result<impl Responder, ApiError> {
    Ok(web::Json(controller.token_set(&query.chain_id, &query.account)?))
}

#[post("/tokens")]
async fn add_tokens(
    controller: Controller,
    body: web::Json<AddTokensRequest>,
) -> Result<impl Responder, ApiError> {
    log::info!("add_tokens - {:?}", body);
    let AddTokensRequest {
        chain_id,
        account,
        tokens,
    } = body.into_inner();

    controller.add_tokens(&chain_id, &account, tokens)?;
    Ok(HttpResponse::NoContent())
}

#[post("/tokens/ignore")]
async fn ignore_tokens(
    controller: Controller,
    body: web::Json<IgnoreTokensRequest>,
) -> Result<impl Responder, ApiError> {
    log::info!("ignore_tokens - {:?}", body);
    controller.ignore_tokens(&body.chain_id, &body.account, &body.addresses)?;
    Ok(HttpResponse::NoContent())
}

#[post("/tokens/watch")]
async fn watch_asset(
    controller: Controller,
    body: web::Json<WatchRequest>,
) -> Result<impl Responder, ApiError> {
    log::info!("watch_asset - {:?}", body);
    let WatchRequest {
        chain_id,
        account,
        asset,
    } = body.into_inner();

    controller.watch_asset(&chain_id, &account, asset).await?;
    Ok(HttpResponse::NoContent())
}

#[delete("/accounts/{address}")]
async fn remove_account(
    controller: Controller,
    address: web::Path<String>,
) -> Result<impl Responder, ApiError> {
    log::info!("remove_account - {address}");
    service::remove_account(&controller, &address)?;
    Ok(HttpResponse::NoContent())
}

#[delete("/chains/{chain_id}")]
async fn remove_chain(
    controller: Controller,
    chain_id: web::Path<String>,
) -> Result<impl Responder, ApiError> {
    log::info!("remove_chain - {chain_id}");
    service::remove_chain(&controller, &chain_id)?;
    Ok(HttpResponse::NoContent())
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(get_balances)
        .service(refresh_balances)
        .service(get_tokens)
        .service(add_tokens)
        .service(ignore_tokens)
        .service(watch_asset)
        .service(remove_account)
        .service(remove_chain);
}
