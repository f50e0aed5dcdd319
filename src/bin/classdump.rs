use std::{env, fs, process};

fn main() {
    let Some(path) = env::args().nth(1) else {
        eprintln!("usage: classdump <file.class>");
        process::exit(2);
    };
    let bytes = fs::read(&path).expect("read class file");
    match shrike::class::class_file(&bytes) {
        Ok((_, class)) => println!("{:#?}", class),
        Err(err) => {
            eprintln!("{}: malformed class file: {:?}", path, err);
            process::exit(1);
        }
    }
}
