use docket_primitives::entity::FieldValue;
use docket_primitives::ids::EntityRef;
use docket_primitives::view::ViewKey;
use docket_sync::SyncClient;

fn ids(client: &SyncClient, list: &ViewKey) -> String {
    let Some(snapshot) = client.snapshot(list) else {
        return "<unregistered>".to_owned();
    };
    let Some(list) = snapshot.as_list() else {
        return "<not a list>".to_owned();
    };

    let mut rendered: Vec<String> = list.ids().iter().map(ToString::to_string).collect();
    if list.has_more {
        rendered.push("…".to_owned());
    }
    if list.stale {
        rendered.push("(stale)".to_owned());
    }
    rendered.join(" ")
}

fn count(client: &SyncClient, key: &ViewKey) -> String {
    client
        .snapshot(key)
        .and_then(|snapshot| snapshot.as_scalar().copied())
        .map_or_else(
            || "<unregistered>".to_owned(),
            |scalar| {
                if scalar.stale {
                    format!("{} (stale)", scalar.value)
                } else {
                    scalar.value.to_string()
                }
            },
        )
}

/// Prints one line describing the open list and the open counter.
pub fn views(label: &str, client: &SyncClient, list: &ViewKey, counter: &ViewKey) {
    println!(
        "{label:>12} | open: {:<32} | open count: {}",
        ids(client, list),
        count(client, counter)
    );
}

pub fn field(client: &SyncClient, entity: EntityRef, name: &str) {
    let value = client
        .entity(&entity)
        .map_or(FieldValue::Null, |entity| entity.get(name).clone());
    let rendered = match value {
        FieldValue::Null => "-".to_owned(),
        FieldValue::Bool(value) => value.to_string(),
        FieldValue::Int(value) => value.to_string(),
        FieldValue::Text(value) => value,
    };
    println!("{:>12} | {name}: {rendered}", entity.to_string());
}
