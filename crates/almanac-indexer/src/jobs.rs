//! ABI job grouping helpers.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use almanac_chain::registry::{AbiEntry, CustomerUpdates};
use almanac_common::codec::encode_address;
use almanac_common::types::{AbiJob, AbiJobsDeployInfo};

/// Group jobs into per-customer routing maps plus a per-address record
/// of deployment blocks and job ids. Jobs without a deployment block are
/// treated as deployed at block 1.
pub fn convert_to_customer_updates(
    jobs: &[AbiJob],
) -> (Vec<CustomerUpdates>, HashMap<String, AbiJobsDeployInfo>) {
    let mut updates: HashMap<String, CustomerUpdates> = HashMap::new();
    let mut deploy_info: HashMap<String, AbiJobsDeployInfo> = HashMap::new();

    for job in jobs {
        let address = encode_address(&job.address);
        let customer_id = job
            .customer_id
            .map(|id| id.to_string())
            .unwrap_or_default();

        let customer = updates
            .entry(customer_id.clone())
            .or_insert_with(|| CustomerUpdates {
                customer_id,
                abis: HashMap::new(),
            });
        customer.abis.entry(address.clone()).or_default().insert(
            job.abi_selector.clone(),
            Arc::new(AbiEntry::new(
                job.abi.clone(),
                job.abi_name.clone(),
                job.abi_type.clone().unwrap_or_else(|| "function".to_string()),
            )),
        );

        let info = deploy_info.entry(address).or_insert_with(|| AbiJobsDeployInfo {
            deployed_block_number: job.deployment_block_number.unwrap_or(1) as u64,
            ids: Vec::new(),
        });
        info.ids.push(job.id);
    }

    (updates.into_values().collect(), deploy_info)
}

pub fn filter_abi_jobs(jobs: &[AbiJob], ids: &[Uuid]) -> Vec<AbiJob> {
    jobs.iter()
        .filter(|job| ids.contains(&job.id))
        .cloned()
        .collect()
}

/// Job ids across all chains, logging a per-chain breakdown unless silent.
pub fn get_job_ids(jobs: &[AbiJob], silent: bool) -> Vec<Uuid> {
    let mut per_chain: HashMap<&str, usize> = HashMap::new();
    for job in jobs {
        *per_chain.entry(job.chain.as_str()).or_default() += 1;
    }

    if !silent {
        tracing::info!("Found {} total:", jobs.len());
        for (chain, count) in &per_chain {
            tracing::info!("- {} - {} jobs", chain, count);
        }
    }

    jobs.iter().map(|job| job.id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn job(customer: Option<Uuid>, selector: &str, deploy_block: Option<i64>) -> AbiJob {
        AbiJob {
            id: Uuid::new_v4(),
            address: vec![0x22; 20],
            user_id: Uuid::new_v4(),
            customer_id: customer,
            abi_selector: selector.to_string(),
            chain: "ethereum".to_string(),
            abi_name: "transfer".to_string(),
            status: "active".to_string(),
            historical_crawl_status: "pending".to_string(),
            progress: 0,
            moonworm_task_pickedup: false,
            abi: "[{}]".to_string(),
            abi_type: Some("function".to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deployment_block_number: deploy_block,
        }
    }

    #[test]
    fn test_convert_groups_by_customer_and_address() {
        let customer = Uuid::new_v4();
        let jobs = vec![
            job(Some(customer), "0xa9059cbb", Some(500)),
            job(Some(customer), "0x095ea7b3", None),
        ];
        let (updates, deploy_info) = convert_to_customer_updates(&jobs);

        assert_eq!(updates.len(), 1);
        let abis = &updates[0].abis;
        let address = encode_address(&[0x22; 20]);
        assert_eq!(abis[&address].len(), 2);

        let info = &deploy_info[&address];
        assert_eq!(info.deployed_block_number, 500);
        assert_eq!(info.ids.len(), 2);
    }

    #[test]
    fn test_missing_deploy_block_defaults_to_one() {
        let jobs = vec![job(None, "0xa9059cbb", None)];
        let (_, deploy_info) = convert_to_customer_updates(&jobs);
        let info = deploy_info.values().next().unwrap();
        assert_eq!(info.deployed_block_number, 1);
    }

    #[test]
    fn test_filter_abi_jobs() {
        let jobs = vec![job(None, "0xa", None), job(None, "0xb", None)];
        let wanted = vec![jobs[1].id];
        let filtered = filter_abi_jobs(&jobs, &wanted);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].abi_selector, "0xb");
    }
}
