use crate::stress_test::{open_replicas, Replica};
use mdcs_core::Key;
use mdcs_db::{Result, StoreConfig};
use mdcs_delta::{Element, Tombstone};
use mdcs_merkle::{BroadcastNetwork, MemoryDag};
use std::time::Duration;
use tracing::info;

fn hide_private(element: &Element) -> Option<Vec<Tombstone>> {
    Some(vec![Tombstone::for_element(element)])
}

/// Wait until every replica reports the same heads.
async fn settle(replicas: &[Replica]) -> Result<bool> {
    for _ in 0..100 {
        let mut heads = Vec::with_capacity(replicas.len());
        for replica in replicas {
            heads.push(replica.heads()?);
        }
        if heads.windows(2).all(|pair| pair[0] == pair[1]) {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(false)
}

fn print_replicas(title: &str, replicas: &[Replica]) -> Result<()> {
    println!("\n── {} ──", title);
    for replica in replicas {
        let stats = replica.stats()?;
        println!(
            "  {} (heads: {}, height: {})",
            replica.config().replica_id,
            stats.heads,
            stats.max_height
        );
        for (key, value) in replica.query(Key::root())? {
            println!("    {:<20} = {}", key, String::from_utf8_lossy(&value));
        }
    }
    Ok(())
}

/// Replicas gossiping over the in-process broadcast hub.
///
/// Replica 0 refuses anything under `/private`, so its view differs from
/// its peers while its heads still track theirs.
pub async fn live_demo(num_replicas: usize, config: &StoreConfig) -> Result<()> {
    let dag = MemoryDag::new();
    let network = BroadcastNetwork::new();
    let replicas = open_replicas("/demo", num_replicas.max(2), &dag, &network, config);

    replicas[0]
        .filter()
        .register_element_filter("^/private/", hide_private)?;

    let mut tasks = Vec::with_capacity(replicas.len());
    for replica in &replicas {
        tasks.push(replica.subscribe().await?);
    }

    for (idx, replica) in replicas.iter().enumerate() {
        replica
            .put(format!("greeting/{}", idx), format!("hello from {}", idx))
            .await?;
        replica.put("shared", format!("written by {}", idx)).await?;
    }
    replicas[1].put("private/notes", "not for replica_0").await?;

    let settled = settle(&replicas).await?;
    info!(settled, "after concurrent writes");
    print_replicas("After concurrent writes", &replicas)?;

    replicas[1].delete("shared").await?;
    let settled = settle(&replicas).await?;
    info!(settled, "after delete");
    print_replicas("After replica_1 deletes /shared", &replicas)?;

    for task in tasks {
        task.abort();
    }
    Ok(())
}
