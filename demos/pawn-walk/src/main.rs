use std::time::Duration;

use reverb::prelude::*;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Replicated type
// ---------------------------------------------------------------------------

/// A named pawn on a grid. The name travels as extra state.
struct Pawn {
    state: ObjectState,
    name: String,
}

impl Pawn {
    fn new(name: &str, position: Position) -> Result<Self, ObjectError> {
        let state = ObjectState::new(position, Facing::North).with_extra([name])?;
        Ok(Self {
            state,
            name: name.to_string(),
        })
    }

    fn name_from_extra(state: &ObjectState) -> String {
        state
            .extra_state()
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("pawn")
            .to_string()
    }
}

impl Replicate for Pawn {
    const TYPE_NAME: &'static str = "Pawn";

    fn state(&self) -> &ObjectState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ObjectState {
        &mut self.state
    }

    fn from_state(state: ObjectState) -> Result<Self, ObjectError> {
        let name = Self::name_from_extra(&state);
        Ok(Self { state, name })
    }

    fn on_extra_state_synced(&mut self) -> Result<(), ObjectError> {
        self.name = Self::name_from_extra(&self.state);
        Ok(())
    }

    fn register_methods(methods: &mut MethodTable<Self>) {
        methods
            .method("move", |pawn: &mut Pawn, (facing,): (Facing,)| {
                let (dx, dy) = facing.step();
                pawn.state.facing = facing;
                pawn.state.position = pawn.state.position.offset(dx, dy);
                Ok(())
            })
            .method("rename", |pawn: &mut Pawn, (name,): (String,)| {
                if name.is_empty() {
                    return Err("name must not be empty".into());
                }
                pawn.state.set_extra([&name]).map_err(|e| e.to_string())?;
                pawn.name = name;
                Ok(())
            });
    }
}

// ---------------------------------------------------------------------------
// Walkthrough
// ---------------------------------------------------------------------------

async fn wait_for_mirror(client: &ReverbClient, id: &ObjectId) -> bool {
    for _ in 0..100 {
        if client.object_ids().contains(id) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn describe(client: &ReverbClient, id: &ObjectId) -> Result<String, ReverbError> {
    client.with_object::<Pawn, _>(id, |pawn| {
        format!(
            "{} at {} facing {}",
            pawn.name, pawn.state.position, pawn.state.facing
        )
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let server = ReverbServer::builder()
        .bind("127.0.0.1:0")
        .sync_rate(10)
        .build();
    let addr = server.start().await?;
    let id = server.create_object(Pawn::new("scout", Position::new(0.0, 0.0))?)?;
    tracing::info!(%addr, %id, "server up with one pawn");

    let client = ReverbClient::default();
    client.register_type::<Pawn>();
    client.on(events::INVOKE_REJECTED, |_, payload| {
        println!("rejected: {payload}");
        Ok(())
    });
    client.connect(&addr.to_string()).await?;

    if !wait_for_mirror(&client, &id).await {
        return Err("no snapshot arrived".into());
    }
    println!("mirrored: {}", describe(&client, &id)?);

    for facing in ["E", "E", "N"] {
        client.invoke_on_server(&id, "move", &(facing,))?;
    }
    client.invoke_on_server(&id, "rename", &("ranger",))?;
    client.invoke_on_server(&id, "rename", &("",))?;

    tokio::time::sleep(Duration::from_millis(400)).await;
    println!("after walking: {}", describe(&client, &id)?);

    client.disconnect().await;
    server.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rename_reaches_mirror_through_extra_state() {
        let server = ReverbServer::builder().bind("127.0.0.1:0").sync_rate(50).build();
        let addr = server.start().await.unwrap();
        let id = server
            .create_object(Pawn::new("scout", Position::new(3.0, 4.0)).unwrap())
            .unwrap();

        let client = ReverbClient::default();
        client.register_type::<Pawn>();
        client.connect(&addr.to_string()).await.unwrap();
        assert!(wait_for_mirror(&client, &id).await);
        assert_eq!(describe(&client, &id).unwrap(), "scout at (3, 4) facing N");

        client.invoke_on_server(&id, "rename", &("ranger",)).unwrap();
        client.invoke_on_server(&id, "move", &("W",)).unwrap();

        let mut seen = String::new();
        for _ in 0..100 {
            seen = describe(&client, &id).unwrap();
            if seen.starts_with("ranger") && seen.contains("facing W") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(seen, "ranger at (2, 4) facing W");
        server.stop().await;
    }
}
