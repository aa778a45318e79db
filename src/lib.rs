//! A hierarchical, file-backed configuration database

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod assembler;
pub mod cache;
pub mod config;
pub mod curl;
pub mod dal;
pub mod dao;
pub mod error;
pub mod http;
pub mod listener;
pub mod metrics;
pub mod monitor;
pub mod node_tree;
pub mod record;
pub mod recovery;
pub mod repeat_guard;
pub mod resolver;
pub mod schemas;
pub mod server;
pub mod state;
pub mod subscriptions;

#[cfg(test)]
mod test_utils;

pub use self::{
    dal::{Builder, Dal},
    dao::{Dao, DaoHandle},
    error::DalError,
    listener::{ChangeListener, ListenerConnector},
    subscriptions::ListenerId,
};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use testresult::TestResult;

    use crate::{
        config::CDB_DIR, listener::ChangeNotification, server::Server, test_utils::write_record,
    };

    fn write_tree(root: &std::path::Path) -> std::io::Result<()> {
        let base = root.join(CDB_DIR);
        write_record(
            &base,
            "MACI/Managers/Manager",
            r#"<Manager Timeout="50.0"><Startup><e string="a"/></Startup></Manager>"#,
        )?;
        write_record(&base, "MACI/Containers/C1", r#"<Container Timeout="1"/>"#)?;
        write_record(&base, "MACI/Containers/C2", r#"<Container Timeout="2"/>"#)
    }

    #[tokio::test]
    async fn serves_documents_and_listings() -> TestResult {
        let dir = tempfile::tempdir()?;
        write_tree(dir.path())?;
        let (server, url) = Server::spawn_for_tests(dir.path()).await?;
        let client = reqwest::Client::new();

        let res = client
            .get(url.join("/dal/document")?)
            .query(&[("curl", "MACI/Containers/C1")])
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.text().await?, r#"<Container Timeout="1"/>"#);

        let nodes = client.get(url.join("/dal/nodes")?).send().await?.text().await?;
        assert_eq!(nodes, "MACI");
        let daos = client
            .get(url.join("/dal/daos")?)
            .query(&[("curl", "MACI/Managers/Manager")])
            .send()
            .await?
            .text()
            .await?;
        assert_eq!(daos, "Startup");
        let name = client
            .get(url.join("/dal/configuration-name")?)
            .send()
            .await?
            .text()
            .await?;
        assert_eq!(name, "XML");

        let res = client
            .get(url.join("/dal/document")?)
            .query(&[("curl", "MACI/Containers/C9")])
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body: Value = res.json().await?;
        assert_eq!(body["status"], "404");
        assert_eq!(body["detail"], "curl 'MACI/Containers/C9' does not exist");

        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn binds_daos_and_reads_fields() -> TestResult {
        let dir = tempfile::tempdir()?;
        write_tree(dir.path())?;
        let (server, url) = Server::spawn_for_tests(dir.path()).await?;
        let client = reqwest::Client::new();

        let dao_url = url.join("/dal/dao")?;
        let mut handles = Vec::new();
        for _ in 0..2 {
            let res: Value = client
                .post(dao_url.clone())
                .query(&[("curl", "MACI/Managers/Manager")])
                .send()
                .await?
                .json()
                .await?;
            assert_eq!(res["curl"], "MACI/Managers/Manager");
            handles.push(res["handle"].clone());
        }
        assert_eq!(handles[0], handles[1]);

        let field_url = url.join("/dal/dao/field")?;
        let res = client
            .get(field_url.clone())
            .query(&[("curl", "MACI/Managers/Manager"), ("field", "Timeout")])
            .send()
            .await?;
        assert_eq!(res.text().await?, "50.0");
        let res = client
            .get(field_url)
            .query(&[("curl", "MACI/Managers/Manager"), ("field", "Missing")])
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn notifies_http_listeners_on_clear() -> TestResult {
        let dir = tempfile::tempdir()?;
        write_tree(dir.path())?;
        let (server, url) = Server::spawn_for_tests(dir.path()).await?;
        let client = reqwest::Client::new();

        let received = Arc::new(Mutex::new(Vec::new()));
        let callback = Router::new()
            .route(
                "/changed",
                post(
                    |State(received): State<Arc<Mutex<Vec<String>>>>,
                     Json(body): Json<ChangeNotification>| async move {
                        received.lock().push(body.curl);
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let callback_addr = listener.local_addr()?;
        let callback_task = tokio::spawn(async move {
            axum::serve(listener, callback).await.ok();
        });

        let res: Value = client
            .post(url.join("/dal/listeners")?)
            .json(&json!({ "reference": format!("http://{callback_addr}/changed") }))
            .send()
            .await?
            .json()
            .await?;
        let id = res["id"].as_u64().ok_or("listener id")?;

        let res = client
            .post(url.join(&format!("/dal/listeners/{id}/subscriptions"))?)
            .query(&[("curl", "MACI/Containers/C1")])
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let res = client
            .post(url.join("/dal/clear")?)
            .query(&[("curl", "/MACI/Containers/C1/")])
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert_eq!(*received.lock(), vec!["MACI/Containers/C1"]);

        let res = client
            .delete(url.join(&format!("/dal/listeners/{id}"))?)
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        client.post(url.join("/dal/clear-all")?).send().await?;
        assert_eq!(received.lock().len(), 1);

        let res = client
            .post(url.join("/dal/listeners")?)
            .json(&json!({ "reference": "not a url" }))
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        callback_task.abort();
        server.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_over_http_stops_the_server() -> TestResult {
        let dir = tempfile::tempdir()?;
        write_tree(dir.path())?;
        let (server, url) = Server::spawn_for_tests(dir.path()).await?;
        let dal = server.dal().clone();

        let res = reqwest::Client::new()
            .post(url.join("/dal/shutdown")?)
            .send()
            .await?;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        assert!(dal.is_shutdown());
        assert!(dal.get_document("MACI").await.is_err());

        tokio::time::timeout(std::time::Duration::from_secs(5), server.run_until_error())
            .await??;
        Ok(())
    }
}
