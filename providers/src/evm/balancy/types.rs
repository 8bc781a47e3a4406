use crate::evm::u256_from_str;
use serde::Deserialize;
use serde_aux::prelude::deserialize_default_from_null;
use thiserror::Error;
use web3::types::{Address, U256};

#[derive(Error, Debug)]
pub enum BalancyError {
    #[error("Chain `{0}` is not supported by Balancy")]
    ChainNotSupported(String),
    #[error("Invalid Balancy request")]
    InvalidBalancyRequest,
    #[error("Too many requests to Balancy")]
    TooManyRequests,
    #[error("Unknown Balancy error (status {0})")]
    Unknown(u16),
    #[error("{0}")]
    RequestFailed(#[from] reqwest::Error),
}

#[derive(Deserialize, Debug)]
pub struct Erc20 {
    pub address: Address,
    #[serde(deserialize_with = "u256_from_str")]
    pub amount: U256,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Erc721 {
    pub address: Address,
    #[serde(deserialize_with = "u256_from_str")]
    pub token_id: U256,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
pub struct Erc1155 {
    pub addr: Address,
    #[serde(deserialize_with = "u256_from_str")]
    pub token_id: U256,
    #[serde(deserialize_with = "u256_from_str")]
    pub amount: U256,
}

#[derive(Deserialize, Debug, Default)]
pub struct AddressTokenResponse {
    #[serde(default, deserialize_with = "deserialize_default_from_null")]
    pub erc20: Vec<Erc20>,
    #[serde(default, deserialize_with = "deserialize_default_from_null")]
    pub erc721: Vec<Erc721>,
    #[serde(default, deserialize_with = "deserialize_default_from_null")]
    pub erc1155: Vec<Erc1155>,
}
