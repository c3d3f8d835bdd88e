use std::fs;
use std::io::Write;
use std::path::Path;

// 编译时把 migrations/*.sql 按文件名顺序嵌入二进制，`privchat-admission migrate` 使用
fn main() {
    let migrations_dir = Path::new("migrations");
    let out_dir = std::env::var("OUT_DIR").unwrap();
    let dest_path = Path::new(&out_dir).join("migrations.rs");

    println!("cargo:rerun-if-changed=migrations/");

    let mut entries: Vec<String> = Vec::new();

    if migrations_dir.exists() {
        let mut files: Vec<_> = fs::read_dir(migrations_dir)
            .expect("无法读取 migrations 目录")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".sql"))
            .collect();

        files.sort_by_key(|e| e.file_name());

        for entry in &files {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let name = file_name.trim_end_matches(".sql");
            entries.push(format!(
                "    (\"{name}\", include_str!(concat!(env!(\"CARGO_MANIFEST_DIR\"), \"/migrations/{file_name}\")))",
            ));
        }
    }

    let mut f = fs::File::create(&dest_path).expect("无法创建 migrations.rs");
    writeln!(
        f,
        "/// 限流表迁移脚本（build.rs 生成）\n\
         pub const MIGRATIONS: &[(&str, &str)] = &[\n{}\n];",
        entries.join(",\n")
    )
    .expect("无法写入 migrations.rs");
}
