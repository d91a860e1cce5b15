//! Live-network smoke tests; run with `cargo test -- --ignored` when online.

use h2mux::{Client, Request};

#[tokio::test]
#[ignore = "hits the network"]
async fn example_com() {
    let client = Client::default();
    let response = client
        .request(Request::get("https://example.com/".try_into().unwrap()))
        .await
        .unwrap();
    assert_eq!(response.status(), Some(200));
    assert!(response
        .text()
        .contains("This domain is for use in illustrative examples in documents."));
}

#[tokio::test]
#[ignore = "hits the network"]
async fn google_redirect() {
    let client = Client::default();
    let request = Request::get("https://google.com/".try_into().unwrap());
    let response = client.request(request.clone()).await.unwrap();
    assert_eq!(response.status(), Some(301));
    assert_eq!(response.header("Location"), Some("https://www.google.com/"));

    let follow_up = request.redirect(&response).unwrap();
    let response = client.request(follow_up).await.unwrap();
    assert_eq!(response.status(), Some(200));
}

#[cfg(feature = "json")]
mod json {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize)]
    struct CreateUser {
        name: String,
        job: String,
    }

    #[derive(Debug, Clone, Deserialize)]
    struct CreateUserResponse {
        name: String,
        job: String,
    }

    #[tokio::test]
    #[ignore = "hits the network"]
    async fn create_user() {
        let client = Client::default();
        let response = client
            .request(
                Request::post_json(
                    "https://reqres.in/api/users/".try_into().unwrap(),
                    &CreateUser {
                        name: "morpheus".to_string(),
                        job: "leader".to_string(),
                    },
                )
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), Some(201));

        let data: CreateUserResponse = response.json().unwrap();
        assert_eq!(data.name, "morpheus");
        assert_eq!(data.job, "leader");
    }
}
