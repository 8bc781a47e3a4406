use crate::evm::{ProviderError, RpcClient, ERC20};
use web3::{ethabi::Token, types::Address};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erc20Metadata {
    pub symbol: String,
    pub decimals: u8,
    pub name: Option<String>,
}

/// Probes `symbol`, `decimals` and `name` at the latest block. `name` is
/// optional on ERC-20 and never fails the probe.
pub async fn token_metadata(
    client: &dyn RpcClient,
    token: Address,
) -> Result<Erc20Metadata, ProviderError> {
    let symbol = query(client, token, "symbol")
        .await?
        .into_string()
        .ok_or_else(|| ProviderError::Other(format!("{token:#x} has no string symbol")))?;

    let decimals = query(client, token, "decimals")
        .await?
        .into_uint()
        .filter(|d| *d <= u8::MAX.into())
        .ok_or_else(|| ProviderError::Other(format!("{token:#x} has no valid decimals")))?
        .low_u32() as u8;

    let name = match query(client, token, "name").await {
        Ok(name) => name.into_string(),
        Err(e) => {
            log::debug!("{token:#x} has no name: {e}");
            None
        }
    };

    Ok(Erc20Metadata {
        symbol,
        decimals,
        name,
    })
}

async fn query(
    client: &dyn RpcClient,
    token: Address,
    function: &str,
) -> Result<Token, ProviderError> {
    let function = ERC20.function(function)?;
    let response = client.call(token, function.encode_input(&[])?, None).await?;

    function
        .decode_output(&response)?
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Other(format!("{} returned nothing", function.name)))
}
