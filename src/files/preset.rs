//! Fixed scaffold every generated app is mounted on top of.

use crate::models::FileMap;

/// Module the render beacon reads the active run id from.
pub const RUN_MARKER_PATH: &str = "src/preview/run.ts";

const PACKAGE_JSON: &str = r#"{
  "name": "vibe-app",
  "private": true,
  "version": "0.0.0",
  "type": "module",
  "scripts": {
    "dev": "vite --host 0.0.0.0",
    "build": "tsc -b && vite build",
    "preview": "vite preview"
  },
  "dependencies": {
    "class-variance-authority": "^0.7.0",
    "clsx": "^2.1.1",
    "react": "^18.3.1",
    "react-dom": "^18.3.1",
    "react-router-dom": "^6.26.1",
    "tailwind-merge": "^2.5.2"
  },
  "devDependencies": {
    "@types/react": "^18.3.3",
    "@types/react-dom": "^18.3.0",
    "@vitejs/plugin-react": "^4.3.1",
    "autoprefixer": "^10.4.20",
    "postcss": "^8.4.41",
    "tailwindcss": "^3.4.10",
    "typescript": "^5.5.4",
    "vite": "^5.4.2"
  }
}
"#;

const VITE_CONFIG: &str = r#"import { defineConfig } from "vite";
import react from "@vitejs/plugin-react";
import path from "node:path";

export default defineConfig({
  plugins: [react()],
  resolve: {
    alias: { "@": path.resolve(__dirname, "./src") },
  },
  server: { strictPort: false },
});
"#;

const TSCONFIG: &str = r#"{
  "compilerOptions": {
    "target": "ES2020",
    "lib": ["ES2020", "DOM", "DOM.Iterable"],
    "module": "ESNext",
    "moduleResolution": "bundler",
    "jsx": "react-jsx",
    "strict": true,
    "skipLibCheck": true,
    "noEmit": true,
    "baseUrl": ".",
    "paths": { "@/*": ["./src/*"] }
  },
  "include": ["src"]
}
"#;

const POSTCSS_CONFIG: &str = r#"export default {
  plugins: { tailwindcss: {}, autoprefixer: {} },
};
"#;

const TAILWIND_CONFIG: &str = r#"/** @type {import('tailwindcss').Config} */
export default {
  content: ["./index.html", "./src/**/*.{ts,tsx,js,jsx}"],
  theme: { extend: {} },
  plugins: [],
};
"#;

const INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <title>Preview</title>
  </head>
  <body>
    <div id="root"></div>
    <script type="module" src="/src/main.tsx"></script>
  </body>
</html>
"#;

const MAIN_TSX: &str = r#"import React from "react";
import ReactDOM from "react-dom/client";
import { BrowserRouter } from "react-router-dom";
import "./index.css";
import { installBeacon } from "./preview/beacon";
import App from "./App";

installBeacon();

ReactDOM.createRoot(document.getElementById("root")!).render(
  <React.StrictMode>
    <BrowserRouter>
      <App />
    </BrowserRouter>
  </React.StrictMode>,
);
"#;

const APP_TSX: &str = r#"import { Routes, Route } from "react-router-dom";
import { useRendered } from "./preview/beacon";
import Index from "./pages/Index";

export default function App() {
  useRendered();
  return (
    <Routes>
      <Route path="/" element={<Index />} />
    </Routes>
  );
}
"#;

const INDEX_PAGE_TSX: &str = r#"import { AppShell } from "@/components/app/AppShell";

export default function Index() {
  return <AppShell title="Generated app" />;
}
"#;

const INDEX_CSS: &str = r#"@tailwind base;
@tailwind components;
@tailwind utilities;
"#;

const UTILS_TS: &str = r#"import { clsx, type ClassValue } from "clsx";
import { twMerge } from "tailwind-merge";

export function cn(...inputs: ClassValue[]) {
  return twMerge(clsx(inputs));
}
"#;

const APP_SHELL_TSX: &str = r#"import type { ReactNode } from "react";

export function AppShell({ title, children }: { title: string; children?: ReactNode }) {
  return (
    <div className="min-h-screen bg-background text-foreground">
      <header className="border-b px-6 py-4 font-semibold">{title}</header>
      <main className="p-6">{children}</main>
    </div>
  );
}
"#;

const BUTTON_TSX: &str = r#"import type { ButtonHTMLAttributes } from "react";
import { cn } from "@/lib/utils";

export function Button({ className, ...props }: ButtonHTMLAttributes<HTMLButtonElement>) {
  return (
    <button
      className={cn("inline-flex items-center rounded-md px-4 py-2 text-sm font-medium", className)}
      {...props}
    />
  );
}
"#;

const BEACON_TS: &str = r#"import { useEffect } from "react";
import { RUN_ID } from "./run";

function post(payload: Record<string, unknown>) {
  try {
    window.parent.postMessage({ runId: RUN_ID, ...payload }, "*");
  } catch {
    // parent gone
  }
}

export function installBeacon() {
  const original = console.error.bind(console);
  console.error = (...args: unknown[]) => {
    post({ type: "CONSOLE_ERROR", message: args.map(String).join(" ") });
    original(...args);
  };
  window.addEventListener("error", (event) => {
    post({ type: "CONSOLE_ERROR", message: event.message });
  });
  window.addEventListener("unhandledrejection", (event) => {
    post({ type: "CONSOLE_ERROR", message: String(event.reason) });
  });
}

export function useRendered() {
  useEffect(() => {
    requestAnimationFrame(() => post({ type: "APP_RENDERED" }));
  }, []);
}
"#;

/// Paths and contents of the scaffold. Only the placeholder page may be
/// replaced by generated output.
pub fn preset_files() -> FileMap {
    [
        ("package.json", PACKAGE_JSON),
        ("vite.config.ts", VITE_CONFIG),
        ("tsconfig.json", TSCONFIG),
        ("postcss.config.js", POSTCSS_CONFIG),
        ("tailwind.config.js", TAILWIND_CONFIG),
        ("index.html", INDEX_HTML),
        ("src/main.tsx", MAIN_TSX),
        ("src/App.tsx", APP_TSX),
        ("src/pages/Index.tsx", INDEX_PAGE_TSX),
        ("src/index.css", INDEX_CSS),
        ("src/lib/utils.ts", UTILS_TS),
        ("src/components/app/AppShell.tsx", APP_SHELL_TSX),
        ("src/components/ui/button.tsx", BUTTON_TSX),
        ("src/preview/beacon.ts", BEACON_TS),
        (RUN_MARKER_PATH, run_marker("").as_str()),
    ]
    .into_iter()
    .map(|(path, contents)| (path.to_string(), contents.to_string()))
    .collect()
}

/// Contents of the module that tags beacon messages with `run_id`.
pub fn run_marker(run_id: &str) -> String {
    let quoted = serde_json::Value::String(run_id.to_string());
    format!("export const RUN_ID = {};\n", quoted)
}

#[cfg(test)]
mod tests {
    use super::{preset_files, run_marker, RUN_MARKER_PATH};
    use crate::files::policy::{check_path, PathVerdict};

    #[test]
    fn preset_manifest_is_valid_json_with_dev_script() {
        let files = preset_files();
        let manifest: serde_json::Value =
            serde_json::from_str(files.get("package.json").expect("manifest")).expect("json");
        assert!(manifest["scripts"]["dev"].as_str().is_some());
        assert!(manifest["dependencies"]["react"].is_string());
    }

    #[test]
    fn preset_scaffold_is_protected_from_generated_output() {
        for path in preset_files().keys() {
            match path.as_str() {
                "src/App.tsx" => assert_eq!(check_path(path), PathVerdict::Unauthorized),
                "src/pages/Index.tsx" => assert_eq!(check_path(path), PathVerdict::Allowed),
                _ => assert_eq!(check_path(path), PathVerdict::Protected, "{path}"),
            }
        }
    }

    #[test]
    fn run_marker_quotes_the_id() {
        assert_eq!(run_marker("abc\"1"), "export const RUN_ID = \"abc\\\"1\";\n");
        assert!(preset_files().contains_key(RUN_MARKER_PATH));
    }
}
