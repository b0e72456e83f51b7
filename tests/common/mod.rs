#![allow(dead_code)]

use chrono::Utc;
use dpc_queue::{JobRequest, ResourceType};
use uuid::Uuid;

pub fn request(org_id: Uuid, patients: &[&str], resource_types: &[ResourceType]) -> JobRequest {
    JobRequest {
        org_id,
        org_npi: "1234567893".into(),
        provider_npi: "1234567812".into(),
        patients: patients.iter().map(|p| p.to_string()).collect(),
        resource_types: resource_types.to_vec(),
        since: None,
        transaction_time: Utc::now(),
        requesting_ip: Some("127.0.0.1".into()),
        request_url: Some("https://dpc.local/api/v1/Group/1/$export".into()),
        is_bulk: true,
        use_cache: false,
        is_smoke: false,
    }
}

pub fn patients(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("MBI{:06}", i)).collect()
}
