use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error};

use crate::api::v1::{
    log_server, CreateRecordRequest, CreateRecordResponse, GetRecordRequest, GetRecordResponse,
    GetServersRequest, GetServersResponse, Record, Server,
};
use crate::auth::{Action, Authorizer, PeerIdentity, OBJECT_WILDCARD};
use crate::distributed::{DistributedError, DistributedLog};
use crate::log::{Log, LogError};

/// Storage the service appends to and reads from: the plain log in
/// single-node setups, the distributed log in a cluster.
#[tonic::async_trait]
pub trait CommitLog: Send + Sync + 'static {
    async fn append(&self, record: Record) -> Result<u64, DistributedError>;
    async fn read(&self, offset: u64) -> Result<Record, DistributedError>;
    /// Signal fired after every append, for tailing readers.
    fn subscribe(&self) -> Arc<Notify>;
}

#[tonic::async_trait]
impl CommitLog for Log {
    async fn append(&self, record: Record) -> Result<u64, DistributedError> {
        Ok(Log::append(self, record)?)
    }

    async fn read(&self, offset: u64) -> Result<Record, DistributedError> {
        Ok(Log::read(self, offset)?)
    }

    fn subscribe(&self) -> Arc<Notify> {
        Log::subscribe(self)
    }
}

#[tonic::async_trait]
impl CommitLog for DistributedLog {
    async fn append(&self, record: Record) -> Result<u64, DistributedError> {
        DistributedLog::append(self, record).await
    }

    async fn read(&self, offset: u64) -> Result<Record, DistributedError> {
        DistributedLog::read(self, offset)
    }

    fn subscribe(&self) -> Arc<Notify> {
        self.log().subscribe()
    }
}

/// Source of cluster membership for `GetServers`.
pub trait ServerProvider: Send + Sync + 'static {
    fn get_servers(&self) -> Result<Vec<Server>, DistributedError>;
}

impl ServerProvider for DistributedLog {
    fn get_servers(&self) -> Result<Vec<Server>, DistributedError> {
        DistributedLog::get_servers(self)
    }
}

pub struct GrpcConfig {
    pub commit_log: Arc<dyn CommitLog>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub server_provider: Option<Arc<dyn ServerProvider>>,
}

impl From<DistributedError> for Status {
    fn from(err: DistributedError) -> Status {
        match err {
            DistributedError::Log(LogError::OffsetOutOfRange(offset)) => {
                Status::out_of_range(format!("offset out of range: {offset}"))
            }
            DistributedError::NotLeader => Status::failed_precondition(err.to_string()),
            DistributedError::Timeout => Status::deadline_exceeded(err.to_string()),
            DistributedError::Malformed(message) => Status::invalid_argument(message),
            other => Status::internal(other.to_string()),
        }
    }
}

/// gRPC front end over a [`CommitLog`].
pub struct LogService {
    config: GrpcConfig,
}

impl LogService {
    pub fn new(config: GrpcConfig) -> LogService {
        LogService { config }
    }

    /// Turns the service into the tonic server wrapper, ready to serve.
    pub fn into_server(self) -> log_server::LogServer<LogService> {
        log_server::LogServer::new(self)
    }

    fn subject<T>(request: &Request<T>) -> String {
        request
            .extensions()
            .get::<PeerIdentity>()
            .and_then(|identity| identity.subject.clone())
            .unwrap_or_default()
    }

    fn authorize(&self, subject: &str, action: Action) -> Result<(), Status> {
        let Some(authorizer) = &self.config.authorizer else {
            return Ok(());
        };
        authorizer
            .authorize(subject, OBJECT_WILDCARD, action)
            .map_err(|e| Status::permission_denied(e.to_string()))
    }

    async fn do_create(&self, request: CreateRecordRequest) -> Result<CreateRecordResponse, Status> {
        let record = request
            .record
            .ok_or_else(|| Status::invalid_argument("record is required"))?;
        let offset = self.config.commit_log.append(record).await?;
        Ok(CreateRecordResponse { offset })
    }

    async fn do_get(&self, request: GetRecordRequest) -> Result<GetRecordResponse, Status> {
        let record = self.config.commit_log.read(request.offset).await?;
        Ok(GetRecordResponse {
            record: Some(record),
        })
    }
}

#[tonic::async_trait]
impl log_server::Log for LogService {
    async fn create(
        &self,
        request: Request<CreateRecordRequest>,
    ) -> Result<Response<CreateRecordResponse>, Status> {
        self.authorize(&Self::subject(&request), Action::Create)?;
        let response = self.do_create(request.into_inner()).await?;
        Ok(Response::new(response))
    }

    async fn get(
        &self,
        request: Request<GetRecordRequest>,
    ) -> Result<Response<GetRecordResponse>, Status> {
        self.authorize(&Self::subject(&request), Action::Get)?;
        let response = self.do_get(request.into_inner()).await?;
        Ok(Response::new(response))
    }

    type CreateStreamStream = ReceiverStream<Result<CreateRecordResponse, Status>>;

    /// Streams appends in, offsets out; the first failure ends the stream.
    async fn create_stream(
        &self,
        request: Request<Streaming<CreateRecordRequest>>,
    ) -> Result<Response<Self::CreateStreamStream>, Status> {
        let subject = Self::subject(&request);
        let mut inbound = request.into_inner();

        let commit_log = self.config.commit_log.clone();
        let authorizer = self.config.authorizer.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            loop {
                let request = match inbound.message().await {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(status) => {
                        debug!(error = %status, "create stream ended");
                        break;
                    }
                };

                if let Some(authorizer) = &authorizer {
                    if let Err(e) =
                        authorizer.authorize(&subject, OBJECT_WILDCARD, Action::Create)
                    {
                        let _ = tx.send(Err(Status::permission_denied(e.to_string()))).await;
                        break;
                    }
                }

                let record = request.record.unwrap_or_default();
                match commit_log.append(record).await {
                    Ok(offset) => {
                        if tx.send(Ok(CreateRecordResponse { offset })).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "stream append failed");
                        let _ = tx.send(Err(Status::from(e))).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type GetStreamStream = ReceiverStream<Result<GetRecordResponse, Status>>;

    /// Streams offsets in, records out. An offset past the end of the log
    /// waits for the record to exist instead of failing, giving tailing
    /// reads; any other failure ends the stream.
    async fn get_stream(
        &self,
        request: Request<Streaming<GetRecordRequest>>,
    ) -> Result<Response<Self::GetStreamStream>, Status> {
        let subject = Self::subject(&request);
        let mut inbound = request.into_inner();

        let commit_log = self.config.commit_log.clone();
        let authorizer = self.config.authorizer.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let appended = commit_log.subscribe();

            'requests: loop {
                let request = match inbound.message().await {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(status) => {
                        debug!(error = %status, "get stream ended");
                        break;
                    }
                };

                if let Some(authorizer) = &authorizer {
                    if let Err(e) = authorizer.authorize(&subject, OBJECT_WILDCARD, Action::Get)
                    {
                        let _ = tx.send(Err(Status::permission_denied(e.to_string()))).await;
                        break;
                    }
                }

                loop {
                    match commit_log.read(request.offset).await {
                        Ok(record) => {
                            let response = GetRecordResponse {
                                record: Some(record),
                            };
                            if tx.send(Ok(response)).await.is_err() {
                                break 'requests;
                            }
                            break;
                        }
                        Err(DistributedError::Log(LogError::OffsetOutOfRange(_))) => {
                            // tail: wait for an append, with a tick as a
                            // fallback for appends that race the wait
                            let notified = appended.notified();
                            tokio::select! {
                                _ = notified => {}
                                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                            }
                            if tx.is_closed() {
                                break 'requests;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "stream read failed");
                            let _ = tx.send(Err(Status::from(e))).await;
                            break 'requests;
                        }
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_servers(
        &self,
        _request: Request<GetServersRequest>,
    ) -> Result<Response<GetServersResponse>, Status> {
        let provider = self
            .config
            .server_provider
            .as_ref()
            .ok_or_else(|| Status::unimplemented("server discovery is not configured"))?;
        let servers = provider.get_servers()?;
        Ok(Response::new(GetServersResponse { servers }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::v1::log_client::LogClient;
    use crate::auth::AclAuthorizer;
    use crate::log::Config;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;
    use tonic::transport::Channel;
    use tonic::Code;

    async fn test_server(
        authorizer: Option<Arc<dyn Authorizer>>,
    ) -> (LogClient<Channel>, Arc<Log>, TempDir, tokio::task::JoinHandle<()>) {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(Log::new(dir.path(), Config::default()).unwrap());

        let service = LogService::new(GrpcConfig {
            commit_log: log.clone(),
            authorizer,
            server_provider: None,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_task = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service.into_server())
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        let client = LogClient::connect(format!("http://{addr}")).await.unwrap();
        (client, log, dir, server_task)
    }

    fn record(value: &str) -> Record {
        Record {
            value: value.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let (mut client, _log, _dir, server) = test_server(None).await;

        let created = client
            .create(CreateRecordRequest {
                record: Some(record("hello world")),
            })
            .await
            .unwrap()
            .into_inner();

        let got = client
            .get(GetRecordRequest {
                offset: created.offset,
            })
            .await
            .unwrap()
            .into_inner()
            .record
            .unwrap();

        assert_eq!(got.value, b"hello world");
        assert_eq!(got.offset, created.offset);

        server.abort();
    }

    #[tokio::test]
    async fn get_past_boundary_is_out_of_range() {
        let (mut client, _log, _dir, server) = test_server(None).await;

        let created = client
            .create(CreateRecordRequest {
                record: Some(record("hello world")),
            })
            .await
            .unwrap()
            .into_inner();

        let err = client
            .get(GetRecordRequest {
                offset: created.offset + 1,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::OutOfRange);

        server.abort();
    }

    #[tokio::test]
    async fn streams_round_trip() {
        let (mut client, _log, _dir, server) = test_server(None).await;

        let requests = ["first", "second", "third"].map(|value| CreateRecordRequest {
            record: Some(record(value)),
        });
        let mut offsets = client
            .create_stream(tokio_stream::iter(requests))
            .await
            .unwrap()
            .into_inner();

        let mut created = Vec::new();
        while let Some(response) = offsets.message().await.unwrap() {
            created.push(response.offset);
        }
        assert_eq!(created, vec![0, 1, 2]);

        let gets = created
            .iter()
            .map(|offset| GetRecordRequest { offset: *offset })
            .collect::<Vec<_>>();
        let mut records = client
            .get_stream(tokio_stream::iter(gets))
            .await
            .unwrap()
            .into_inner();

        for expected in ["first", "second", "third"] {
            let response = records.message().await.unwrap().unwrap();
            assert_eq!(response.record.unwrap().value, expected.as_bytes());
        }

        server.abort();
    }

    #[tokio::test]
    async fn get_stream_tails_past_the_end() {
        let (mut client, log, _dir, server) = test_server(None).await;

        let (req_tx, req_rx) = mpsc::channel(1);
        req_tx
            .send(GetRecordRequest { offset: 0 })
            .await
            .unwrap();

        let mut records = client
            .get_stream(ReceiverStream::new(req_rx))
            .await
            .unwrap()
            .into_inner();

        // nothing in the log yet; the stream should wait rather than fail
        tokio::time::sleep(Duration::from_millis(200)).await;
        log.append(record("late arrival")).unwrap();

        let response = records.message().await.unwrap().unwrap();
        assert_eq!(response.record.unwrap().value, b"late arrival");

        server.abort();
    }

    #[tokio::test]
    async fn unauthorized_subject_is_denied() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(Log::new(dir.path(), Config::default()).unwrap());

        let mut acl = AclAuthorizer::new();
        acl.allow("root", Action::Create).allow("root", Action::Get);

        let service = LogService::new(GrpcConfig {
            commit_log: log,
            authorizer: Some(Arc::new(acl)),
            server_provider: None,
        });

        let identity = |subject: &str| PeerIdentity {
            subject: Some(subject.to_string()),
        };

        use log_server::Log as _;

        let mut request = Request::new(CreateRecordRequest {
            record: Some(record("denied")),
        });
        request.extensions_mut().insert(identity("nobody"));
        let err = service.create(request).await.unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);

        let mut request = Request::new(GetRecordRequest { offset: 0 });
        request.extensions_mut().insert(identity("nobody"));
        let err = service.get(request).await.unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);

        // the permitted subject passes authorization
        let mut request = Request::new(CreateRecordRequest {
            record: Some(record("allowed")),
        });
        request.extensions_mut().insert(identity("root"));
        let response = service.create(request).await.unwrap().into_inner();
        assert_eq!(response.offset, 0);
    }

    #[tokio::test]
    async fn get_servers_unimplemented_without_provider() {
        let (mut client, _log, _dir, server) = test_server(None).await;

        let err = client.get_servers(GetServersRequest {}).await.unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        server.abort();
    }
}
