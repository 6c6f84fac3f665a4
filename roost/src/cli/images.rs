use crate::{engine::Engine, Result};

fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    id.get(..12).unwrap_or(id)
}

fn format_size(bytes: i64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];
    let mut value = bytes.max(0) as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit + 1 < UNITS.len() {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}{}", UNITS[0])
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

fn format_created(seconds: i64) -> Result<String> {
    use time_local::OffsetDateTimeExt;

    let fd = time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    Ok(time::OffsetDateTime::from_unix_timestamp(seconds)?
        .to_local()?
        .format(fd)?)
}

pub fn images(engine: &dyn Engine, reference: &str) -> Result<()> {
    use comfy_table::{Attribute, Cell, ContentArrangement, Table};

    let mut images = engine.image_list(reference)?;
    images.sort_by(|a, b| a.created.cmp(&b.created).reverse());

    let mut table = Table::new();
    table
        .load_preset(comfy_table::presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            ["id", "tags", "created", "size"]
                .into_iter()
                .map(|name| Cell::new(name).add_attribute(Attribute::Bold)),
        );

    for image in &images {
        table.add_row([
            short_id(&image.id).to_owned(),
            image.repo_tags.as_deref().unwrap_or_default().join("\n"),
            format_created(image.created)?,
            format_size(image.size),
        ]);
    }

    println!("{table}");

    Ok(())
}
