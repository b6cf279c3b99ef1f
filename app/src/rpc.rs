//! JSON-RPC v1 surface for operators and clients. Ledger submissions go
//! through the member directly; note-handling methods drive the attached
//! client wallet.

use crate::client::{ClientWallet, InProcessApi};
use crate::member::Member;
use crate::metrics::{RPC_REQUESTS, RPC_REQUEST_DURATION};
use bridge::bitcoin::address::NetworkUnchecked;
use bridge::bitcoin::consensus::encode::deserialize as consensus_deserialize;
use bridge::bitcoin::{Address, ScriptBuf, Transaction};
use bridge::{Database, PegInProof, TxOutProof};
use ecash::Amount;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server};
use serde_derive::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequestV1<'a> {
    pub method: &'a str,
    pub params: Option<&'a RawValue>,
    pub id: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcErrorV1 {
    pub code: i32,
    pub message: String,
}

impl JsonRpcErrorV1 {
    #[allow(unused)]
    fn parse_error() -> Self {
        Self {
            code: -32700,
            message: "Parse error".to_string(),
        }
    }

    fn invalid_request() -> Self {
        Self {
            code: -32600,
            message: "Invalid Request".to_string(),
        }
    }

    fn method_not_found() -> Self {
        Self {
            code: -32601,
            message: "Method not found".to_string(),
        }
    }

    fn invalid_params() -> Self {
        Self {
            code: -32602,
            message: "Invalid params".to_string(),
        }
    }

    fn debug_error(error_msg: String) -> Self {
        Self {
            code: -32605,
            message: error_msg,
        }
    }
}

macro_rules! new_json_rpc_error {
    ($id:expr, $status:expr, $error:expr) => {
        Response::builder().status($status).body(
            JsonRpcResponseV1 {
                result: None,
                error: Some($error),
                id: $id,
            }
            .into(),
        )
    };
}

// https://www.jsonrpc.org/specification_v1#a1.2Response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcResponseV1 {
    pub result: Option<Value>,
    pub error: Option<JsonRpcErrorV1>,
    pub id: Value,
}

impl From<JsonRpcResponseV1> for Body {
    fn from(value: JsonRpcResponseV1) -> Self {
        serde_json::to_string(&value).unwrap().into()
    }
}

type GenericError = Box<dyn std::error::Error + Send + Sync>;
type Result<T> = std::result::Result<T, GenericError>;

async fn http_req_json_rpc<DB: Database + Send + 'static>(
    req: Request<Body>,
    member: Arc<Mutex<Member<DB>>>,
    wallet: Arc<Mutex<ClientWallet<InProcessApi<DB>>>>,
) -> Result<Response<Body>> {
    if req.method() != Method::POST {
        RPC_REQUESTS
            .with_label_values(&["unknown", "method_not_allowed"])
            .inc();
        return Ok(Response::builder()
            .status(hyper::StatusCode::METHOD_NOT_ALLOWED)
            .body("JSONRPC server handles only POST requests".into())?);
    }

    let bytes = hyper::body::to_bytes(req.into_body()).await?;
    let json_req = serde_json::from_slice::<JsonRpcRequestV1>(&bytes)?;
    let id = json_req.id;

    let params = if let Some(raw_value) = json_req.params {
        raw_value
    } else {
        RPC_REQUESTS
            .with_label_values(&[json_req.method, "invalid_request"])
            .inc();
        return Ok(new_json_rpc_error!(
            id,
            hyper::StatusCode::OK,
            JsonRpcErrorV1::invalid_request()
        )?);
    };

    let wallet_response_helper =
        |method: &str, id: Value, result: std::result::Result<Value, crate::error::Error>| {
            match result {
                Ok(value) => {
                    RPC_REQUESTS.with_label_values(&[method, "success"]).inc();
                    Response::builder().status(hyper::StatusCode::OK).body(
                        JsonRpcResponseV1 {
                            result: Some(value),
                            error: None,
                            id,
                        }
                        .into(),
                    )
                }
                Err(e) => {
                    RPC_REQUESTS.with_label_values(&[method, "error"]).inc();
                    new_json_rpc_error!(
                        id,
                        hyper::StatusCode::BAD_REQUEST,
                        JsonRpcErrorV1::debug_error(format!("{:?}", e))
                    )
                }
            }
        };

    // Start a timer for the request processing duration
    let timer = RPC_REQUEST_DURATION
        .with_label_values(&[json_req.method])
        .start_timer();

    let response = match json_req.method {
        "getinfo" => {
            RPC_REQUESTS.with_label_values(&["getinfo", "called"]).inc();
            let member = member.lock().await;
            let balance = wallet.lock().await.balance();
            Response::builder().status(hyper::StatusCode::OK).body(
                JsonRpcResponseV1 {
                    result: Some(json!({
                        "epoch": member.current_epoch(),
                        "network": member.spec().network.to_string(),
                        "members": member.spec().members.len(),
                        "threshold": member.spec().threshold(),
                        "deposit_address": member.deposit_address().to_string(),
                        "balance": balance,
                    })),
                    error: None,
                    id,
                }
                .into(),
            )
        }
        "getpending" => {
            RPC_REQUESTS
                .with_label_values(&["getpending", "called"])
                .inc();
            let pending = member.lock().await.pending();
            Response::builder().status(hyper::StatusCode::OK).body(
                JsonRpcResponseV1 {
                    result: Some(json!(pending)),
                    error: None,
                    id,
                }
                .into(),
            )
        }
        "getdepositaddress" => {
            RPC_REQUESTS
                .with_label_values(&["getdepositaddress", "called"])
                .inc();
            let address = member.lock().await.deposit_address();
            Response::builder().status(hyper::StatusCode::OK).body(
                JsonRpcResponseV1 {
                    result: Some(json!(address.to_string())),
                    error: None,
                    id,
                }
                .into(),
            )
        }
        "pegin" => {
            RPC_REQUESTS.with_label_values(&["pegin", "called"]).inc();

            let deposit_script = member.lock().await.spec().descriptor().deposit_script();
            let proof = match decode_pegin_args(params.get(), &deposit_script) {
                Ok(proof) => proof,
                Err(e) => {
                    RPC_REQUESTS
                        .with_label_values(&["pegin", "invalid_params"])
                        .inc();
                    return Ok(new_json_rpc_error!(
                        id,
                        hyper::StatusCode::BAD_REQUEST,
                        JsonRpcErrorV1::debug_error(e.to_string())
                    )?);
                }
            };

            let result = wallet.lock().await.peg_in(proof).await;
            wallet_response_helper("pegin", id, result.map(|amount| json!(amount)))
        }
        "spend" => {
            let sats = if let Ok([sats]) = serde_json::from_str::<[u64; 1]>(params.get()) {
                sats
            } else {
                RPC_REQUESTS
                    .with_label_values(&["spend", "invalid_params"])
                    .inc();
                return Ok(new_json_rpc_error!(
                    id,
                    hyper::StatusCode::BAD_REQUEST,
                    JsonRpcErrorV1::invalid_params()
                )?);
            };

            let result = wallet.lock().await.spend(Amount::from_sats(sats)).await;
            wallet_response_helper("spend", id, result.map(|token| json!(token)))
        }
        "reissue" => {
            let token = if let Ok([token]) = serde_json::from_str::<[String; 1]>(params.get()) {
                token
            } else {
                RPC_REQUESTS
                    .with_label_values(&["reissue", "invalid_params"])
                    .inc();
                return Ok(new_json_rpc_error!(
                    id,
                    hyper::StatusCode::BAD_REQUEST,
                    JsonRpcErrorV1::invalid_params()
                )?);
            };

            let result = wallet.lock().await.receive(&token).await;
            wallet_response_helper("reissue", id, result.map(|amount| json!(amount)))
        }
        "validatenotes" => {
            let token = if let Ok([token]) = serde_json::from_str::<[String; 1]>(params.get()) {
                token
            } else {
                RPC_REQUESTS
                    .with_label_values(&["validatenotes", "invalid_params"])
                    .inc();
                return Ok(new_json_rpc_error!(
                    id,
                    hyper::StatusCode::BAD_REQUEST,
                    JsonRpcErrorV1::invalid_params()
                )?);
            };

            let result = wallet.lock().await.validate_token(&token).await;
            wallet_response_helper("validatenotes", id, result.map(|amount| json!(amount)))
        }
        "pegout" => {
            let (address, sats) = match serde_json::from_str::<(String, u64)>(params.get())
                .map_err(GenericError::from)
                .and_then(|(address, sats)| {
                    Ok((address.parse::<Address<NetworkUnchecked>>()?, sats))
                }) {
                Ok(args) => args,
                Err(e) => {
                    RPC_REQUESTS
                        .with_label_values(&["pegout", "invalid_params"])
                        .inc();
                    return Ok(new_json_rpc_error!(
                        id,
                        hyper::StatusCode::BAD_REQUEST,
                        JsonRpcErrorV1::debug_error(e.to_string())
                    )?);
                }
            };

            let result = wallet
                .lock()
                .await
                .peg_out(address, Amount::from_sats(sats))
                .await;
            wallet_response_helper("pegout", id, result.map(|txid| json!(txid)))
        }
        "lnpay" => {
            let bolt11 = if let Ok([bolt11]) = serde_json::from_str::<[String; 1]>(params.get()) {
                bolt11
            } else {
                RPC_REQUESTS
                    .with_label_values(&["lnpay", "invalid_params"])
                    .inc();
                return Ok(new_json_rpc_error!(
                    id,
                    hyper::StatusCode::BAD_REQUEST,
                    JsonRpcErrorV1::invalid_params()
                )?);
            };

            let result = wallet.lock().await.pay_invoice(&bolt11).await;
            wallet_response_helper("lnpay", id, result.map(|()| json!(())))
        }
        _ => {
            RPC_REQUESTS
                .with_label_values(&["unknown", "method_not_found"])
                .inc();
            new_json_rpc_error!(
                id,
                hyper::StatusCode::NOT_FOUND,
                JsonRpcErrorV1::method_not_found()
            )
        }
    };

    // Stop the timer and record the duration
    timer.observe_duration();

    Ok(response?)
}

fn decode_pegin_args(encoded: &str, deposit_script: &ScriptBuf) -> Result<PegInProof> {
    let (proof_hex, tx_hex) = serde_json::from_str::<(String, String)>(encoded)?;
    let txout_proof: TxOutProof = consensus_deserialize(&hex::decode(&proof_hex)?)?;
    let transaction: Transaction = consensus_deserialize(&hex::decode(&tx_hex)?)?;
    let output_idx = PegInProof::find_deposit_output(&transaction, deposit_script)
        .ok_or("transaction pays nothing to the federation")?;
    Ok(PegInProof::new(
        txout_proof,
        transaction,
        output_idx,
        deposit_script,
    )?)
}

pub async fn run_server<DB: Database + Send + 'static>(
    member: Arc<Mutex<Member<DB>>>,
    wallet: Arc<Mutex<ClientWallet<InProcessApi<DB>>>>,
    rpc_port: u16,
) {
    let addr = SocketAddr::from(([0, 0, 0, 0], rpc_port));

    info!("Starting RPC server on {}", addr);
    let server = Server::bind(&addr).serve(make_service_fn(move |_conn| {
        let member = member.clone();
        let wallet = wallet.clone();

        async move {
            Ok::<_, GenericError>(service_fn(move |req| {
                let member = member.clone();
                let wallet = wallet.clone();

                http_req_json_rpc(req, member, wallet)
            }))
        }
    }));

    // TODO: handle graceful shutdown
    tokio::spawn(async move {
        if let Err(e) = server.await {
            eprintln!("server error: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_parsing() {
        let json_request = r#"{"method":"spend","params":[42000],"id":1}"#;
        let json_req: JsonRpcRequestV1 = serde_json::from_str(json_request).unwrap();

        assert_eq!(json_req.method, "spend");
        assert_eq!(json_req.id, json!(1));

        let [sats] = serde_json::from_str::<[u64; 1]>(json_req.params.unwrap().get()).unwrap();
        assert_eq!(sats, 42_000);
    }

    #[test]
    fn missing_params_are_detected() {
        let json_request = r#"{"method":"getpending","id":"abc"}"#;
        let json_req: JsonRpcRequestV1 = serde_json::from_str(json_request).unwrap();
        assert!(json_req.params.is_none());
    }

    #[test]
    fn pegout_args_decode() {
        let params = r#"["bcrt1qs758ursh4q9z627kt3pp5yysm78ddny6txaqgw",500]"#;
        let (address, sats) = serde_json::from_str::<(String, u64)>(params).unwrap();
        assert_eq!(sats, 500);
        address.parse::<Address<NetworkUnchecked>>().unwrap();
    }
}
